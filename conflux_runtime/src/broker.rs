//! Broker nodes: the interior of the federation tree.
//!
//! The root broker assigns identities, owns the global interface registry,
//! resolves named targets (queueing unresolved lookups until the peer
//! registers), coordinates the init/exec barriers and derives the
//! federate-level dependency graph. Interior brokers forward: requests go
//! up with their reply path recorded, grants and broadcasts fan out down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;
use tokio::sync::watch;

use conflux_core::flags::frame as fflags;
use conflux_core::{
    GlobalBrokerId, GlobalFederateId, GlobalHandle, IterationRequest, RouteId, Time,
};

use crate::broker_base::{BaseConfig, BrokerBase, BrokerConnector, ChannelConnector, NodeMode};
use crate::command::{Command, Reply, SharedWaiters, Waiters};
use crate::errors::Error;
use crate::frame::{
    Action, ControlFrame, DependencyNotice, InterfaceKind, InterfaceReg, LinkEnd, LinkNotice,
    Relationship, TargetRequest,
};
use crate::query::Sequencing;
use crate::queue::{self, CommandReceiver, CommandSender};
use crate::routes::{ChannelRoute, Route, RouteSet, RouteTable, TaggedRoute};
use crate::timeout::TimeoutMonitor;

/// Where a forwarded request's reply should go.
#[derive(Debug, Clone, Copy)]
enum ReplyPath {
    /// Back out a child route.
    Route(RouteId),
    /// Resolve a waiter on this node.
    Local(u32),
}

#[derive(Debug, Clone)]
struct ChildEntry {
    name: String,
    route: RouteId,
    disconnected: bool,
}

#[derive(Debug, Clone)]
struct FedEntry {
    name: String,
    synthetic: bool,
    disconnected: bool,
}

#[derive(Debug, Clone)]
struct InterfaceEntry {
    handle: GlobalHandle,
    key: String,
    kind: InterfaceKind,
    cloning: bool,
}

#[derive(Debug, Clone)]
struct LinkRecord {
    relationship: Relationship,
    source: LinkEnd,
    target: LinkEnd,
    cloning: bool,
}

pub struct Broker {
    base: BrokerBase,
    connector: Box<dyn BrokerConnector>,
    waiters: SharedWaiters,
    is_root: bool,

    next_child_id: u32,
    next_fed_id: u32,
    children: HashMap<GlobalBrokerId, ChildEntry>,
    federates: HashMap<GlobalFederateId, FedEntry>,
    fed_names: HashMap<String, GlobalFederateId>,
    interfaces: HashMap<(InterfaceKind, String), InterfaceEntry>,
    routing: RouteTable,

    pending_targets: Vec<TargetRequest>,
    links: Vec<LinkRecord>,
    filter_shift: HashMap<GlobalHandle, Time>,
    /// Dependency edges already pushed to the cores, with their delays.
    edges: HashMap<(GlobalFederateId, GlobalFederateId), Time>,

    init_ready: HashSet<GlobalBrokerId>,
    init_granted: bool,
    init_sent: bool,
    exec_round: u16,
    exec_votes: HashMap<GlobalFederateId, IterationRequest>,
    exec_granted: bool,

    /// Forwarded-request table: local message_id → (original id, reply path).
    forwards: HashMap<u32, (u32, ReplyPath)>,
    next_forward_id: u32,
    query_deadlines: Vec<(u32, tokio::time::Instant)>,
    /// message_id of this broker's own identity hello, when one is out.
    own_hello: Option<u32>,
}

struct BrokerLinkInner {
    config: BaseConfig,
    sender: CommandSender,
    waiters: SharedWaiters,
    routes: RouteSet,
    next_route: AtomicU32,
    disconnect: watch::Receiver<bool>,
}

/// Handle to a running broker; also the attachment point for children.
#[derive(Clone)]
pub struct BrokerLink {
    inner: Arc<BrokerLinkInner>,
}

impl BrokerLink {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Open a bidirectional in-process connection for a child node.
    /// Returns the route the child should use as its parent route.
    pub fn attach_child(&self, child_ingress: CommandSender) -> Arc<dyn Route> {
        let rid = RouteId::new(self.inner.next_route.fetch_add(1, Ordering::Relaxed));
        self.inner
            .routes
            .add(rid, Arc::new(ChannelRoute::new(child_ingress)));
        Arc::new(TaggedRoute::new(self.inner.sender.clone(), rid))
    }

    /// Bring the broker up. The root is live immediately; an interior
    /// broker performs the identity hello with its parent.
    pub async fn connect(&self) -> Result<(), Error> {
        let (id, rx) = self.inner.waiters.register();
        self.inner
            .sender
            .send(Command::Frame(ControlFrame::new(Action::Hello).message_id(id)))
            .map_err(|_| Error::Connection("broker command queue closed".into()))?;
        match tokio::time::timeout(self.inner.config.connect_timeout, rx).await {
            Ok(reply) => reply
                .map_err(|_| Error::Connection("broker disconnected".into()))?
                .map(|_| ()),
            Err(_) => Err(Error::Connection(format!(
                "no identity assigned within {:?}",
                self.inner.config.connect_timeout
            ))),
        }
    }

    /// Issue a query against the federation from the broker's side.
    pub async fn query(
        &self,
        target: &str,
        query: &str,
        mode: Sequencing,
    ) -> Result<String, Error> {
        let (id, rx) = self.inner.waiters.register();
        let mut frame = ControlFrame::new(Action::Query)
            .name(target)
            .info(query)
            .message_id(id);
        if mode == Sequencing::Fast {
            frame = frame.flag(fflags::FAST);
        }
        self.inner
            .sender
            .send(Command::Frame(frame))
            .map_err(|_| Error::Connection("broker command queue closed".into()))?;
        match rx
            .await
            .map_err(|_| Error::Connection("broker disconnected".into()))??
        {
            Reply::Json(json) => Ok(json),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to a query"
            ))),
        }
    }

    /// Ask the broker to shut down once its children have disconnected.
    pub async fn disconnect(&self) {
        let _ = self
            .inner
            .sender
            .send(Command::Frame(ControlFrame::new(Action::Disconnect)));
        self.wait_for_disconnect().await;
    }

    pub async fn wait_for_disconnect(&self) {
        let mut watch = self.inner.disconnect.clone();
        while !*watch.borrow() {
            if watch.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Broker {
    /// Spawn a root broker.
    pub fn spawn(config: BaseConfig) -> BrokerLink {
        Self::spawn_inner(config, None)
    }

    /// Spawn an interior broker attached to a parent.
    pub fn spawn_child(config: BaseConfig, parent: &BrokerLink) -> BrokerLink {
        Self::spawn_inner(config, Some(parent.clone()))
    }

    fn spawn_inner(config: BaseConfig, parent: Option<BrokerLink>) -> BrokerLink {
        let (sender, receiver) = queue::channel();
        let waiters: SharedWaiters = Arc::new(Waiters::default());
        let routes = RouteSet::default();
        if let Some(parent) = &parent {
            routes.add(RouteId::PARENT, parent.attach_child(sender.clone()));
        }

        let monitor = TimeoutMonitor::spawn(sender.clone(), config.tick_period);
        let mut base = BrokerBase::new(config.clone(), sender.clone());
        let is_root = parent.is_none();
        if is_root {
            base.global_id = GlobalBrokerId::ROOT;
            base.mode = NodeMode::Operating;
        }
        let disconnect = base.disconnect_watch();

        let broker = Broker {
            base,
            connector: Box::new(ChannelConnector::new(routes.clone())),
            waiters: waiters.clone(),
            is_root,
            next_child_id: GlobalBrokerId::ROOT.raw() + 1,
            next_fed_id: GlobalFederateId::BASE,
            children: HashMap::new(),
            federates: HashMap::new(),
            fed_names: HashMap::new(),
            interfaces: HashMap::new(),
            routing: RouteTable::default(),
            pending_targets: Vec::new(),
            links: Vec::new(),
            filter_shift: HashMap::new(),
            edges: HashMap::new(),
            init_ready: HashSet::new(),
            init_granted: false,
            init_sent: false,
            exec_round: 0,
            exec_votes: HashMap::new(),
            exec_granted: false,
            forwards: HashMap::new(),
            next_forward_id: 0,
            query_deadlines: Vec::new(),
            own_hello: None,
        };

        tokio::spawn(async move {
            broker.run(receiver).await;
            monitor.abort();
        });

        BrokerLink {
            inner: Arc::new(BrokerLinkInner {
                config,
                sender,
                waiters,
                routes,
                next_route: AtomicU32::new(1),
                disconnect,
            }),
        }
    }

    #[tracing::instrument(skip(self, receiver), fields(broker = %self.base.name()))]
    async fn run(mut self, mut receiver: CommandReceiver) {
        tracing::info!(root = self.is_root, "broker command loop starting");
        while let Some(command) = receiver.next().await {
            match command {
                Command::Frame(frame) => self.handle(None, frame),
                Command::Routed { from, frame } => self.handle(Some(from), frame),
                Command::Reconfigure { config, reply } => {
                    let _ = reply.send(self.base.reconfigure(config).map(|_| Reply::Ack));
                }
                other => {
                    tracing::warn!("broker ignoring command {other:?}");
                }
            }
            if self.base.mode == NodeMode::Terminated {
                break;
            }
        }
        tracing::info!("broker command loop exited");
    }

    fn handle(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        tracing::trace!(broker = %self.base.name(), action = ?frame.action, "processing frame");
        match frame.action {
            Action::Hello => self.handle_hello(from, frame),
            Action::HelloAck => self.handle_hello_ack(frame),
            Action::HelloReject => {
                if self.own_hello == Some(frame.message_id) {
                    self.own_hello = None;
                    self.waiters
                        .resolve(frame.message_id, Err(Error::Connection(frame.info)));
                } else {
                    self.forward_reply(frame);
                }
            }
            Action::RegisterFederate => self.handle_register_federate(from, frame),
            Action::FederateAck => self.handle_federate_ack(frame),
            Action::RegisterInterface => self.handle_register_interface(from, frame),
            Action::InterfaceAck | Action::ErrorReply => self.forward_reply(frame),
            Action::AddTarget => self.handle_add_target(frame),
            Action::FilterTiming => self.handle_filter_timing(frame),
            Action::TargetLink | Action::AddDependency => self.route_down(frame),
            Action::InitReady => self.handle_init_ready(from, frame),
            Action::InitGrant => self.broadcast(frame),
            Action::ExecRequest => self.handle_exec_request(frame),
            Action::ExecGrant => self.broadcast(frame),
            Action::RequestTime => {}
            Action::TimeUpdate | Action::TimeGrant => self.route_down(frame),
            Action::Message => self.handle_message(frame),
            Action::SetValue => self.route_down(frame),
            Action::Publish | Action::Send => {}
            Action::Query => self.handle_query(from, frame),
            Action::QueryReply => self.handle_query_reply(frame),
            Action::LocalError => self.handle_local_error(frame),
            Action::GlobalError => self.handle_global_error(frame),
            Action::Disconnect => self.handle_disconnect(from, frame),
            Action::DisconnectAck => self.handle_disconnect_ack(),
            Action::Ping => {
                if let Some(rid) = from {
                    self.connector
                        .transmit(rid, ControlFrame::new(Action::Pong).message_id(frame.message_id));
                }
            }
            Action::Pong => {}
            Action::Tick => self.handle_tick(),
        }
    }

    // ---- forwarding machinery ----

    /// Forward a request upward, recording where its reply belongs.
    fn forward_up(&mut self, frame: ControlFrame, reply_to: ReplyPath) {
        self.next_forward_id = self.next_forward_id.wrapping_add(1);
        let local_id = self.next_forward_id;
        self.forwards.insert(local_id, (frame.message_id, reply_to));
        let mut frame = frame;
        frame.message_id = local_id;
        self.connector.transmit(RouteId::PARENT, frame);
    }

    /// Un-map a reply that answers a forwarded request, or route it by its
    /// destination federate.
    fn forward_reply(&mut self, mut frame: ControlFrame) {
        if let Some((original, path)) = self.forwards.remove(&frame.message_id) {
            frame.message_id = original;
            match path {
                ReplyPath::Route(rid) => self.connector.transmit(rid, frame),
                ReplyPath::Local(id) => {
                    let result = match frame.action {
                        Action::ErrorReply => Err(Error::from_code(frame.counter, frame.info)),
                        Action::QueryReply => Ok(Reply::Json(
                            String::from_utf8_lossy(&frame.payload).into_owned(),
                        )),
                        _ => Ok(Reply::Ack),
                    };
                    self.waiters.resolve(id, result);
                }
            }
            return;
        }
        self.route_down(frame);
    }

    /// Route a frame towards its destination federate.
    fn route_down(&mut self, frame: ControlFrame) {
        let dest = frame.dest.federate;
        if !dest.is_valid() {
            tracing::warn!(action = ?frame.action, "dropping frame with no destination");
            return;
        }
        if self.routing.known(dest) {
            let rid = self.routing.get(dest);
            self.connector.transmit(rid, frame);
        } else if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
        } else {
            tracing::warn!(%dest, action = ?frame.action, "no route for destination");
        }
    }

    /// Send a frame to every connected child.
    fn broadcast(&mut self, frame: ControlFrame) {
        for child in self.children.values().filter(|c| !c.disconnected) {
            self.connector.transmit(child.route, frame.clone());
        }
    }

    // ---- identity ----

    fn handle_hello(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        let Some(rid) = from else {
            // Our own connect request.
            if self.is_root {
                self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
                return;
            }
            if matches!(self.base.mode, NodeMode::Connecting | NodeMode::Operating) {
                self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
                return;
            }
            self.base.mode = NodeMode::Connecting;
            self.own_hello = Some(frame.message_id);
            self.connector.transmit(
                RouteId::PARENT,
                ControlFrame::new(Action::Hello)
                    .name(self.base.name().to_owned())
                    .message_id(frame.message_id),
            );
            return;
        };
        if !self.is_root {
            self.forward_up(frame, ReplyPath::Route(rid));
            return;
        }
        if self
            .children
            .values()
            .any(|c| !c.disconnected && c.name == frame.name)
        {
            self.connector.transmit(
                rid,
                ControlFrame::new(Action::HelloReject)
                    .message_id(frame.message_id)
                    .info(format!("a node named {} is already connected", frame.name)),
            );
            return;
        }
        let id = GlobalBrokerId::new(self.next_child_id);
        self.next_child_id += 1;
        self.children.insert(
            id,
            ChildEntry {
                name: frame.name.clone(),
                route: rid,
                disconnected: false,
            },
        );
        self.routing.set(id.as_federate(), rid);
        tracing::info!(broker = %self.base.name(), child = %frame.name, %id, "child connected");
        self.connector.transmit(
            rid,
            ControlFrame::new(Action::HelloAck)
                .dest_federate(id.as_federate())
                .name(frame.name)
                .message_id(frame.message_id),
        );
    }

    /// A hello ack is either the answer to our own identity hello or a
    /// child's ack passing through, from which we learn the child's id.
    fn handle_hello_ack(&mut self, frame: ControlFrame) {
        if self.own_hello == Some(frame.message_id) {
            self.own_hello = None;
            self.base.global_id = GlobalBrokerId::new(frame.dest.federate.raw());
            self.base.mode = NodeMode::Operating;
            tracing::info!(broker = %self.base.name(), id = %self.base.global_id, "joined federation");
            self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
            return;
        }
        if let Some((_, ReplyPath::Route(rid))) = self.forwards.get(&frame.message_id) {
            let id = GlobalBrokerId::new(frame.dest.federate.raw());
            self.children.insert(
                id,
                ChildEntry {
                    name: frame.name.clone(),
                    route: *rid,
                    disconnected: false,
                },
            );
            self.routing.set(id.as_federate(), *rid);
        }
        self.forward_reply(frame);
    }

    // ---- registration ----

    fn handle_register_federate(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        let Some(rid) = from else { return };
        if !self.is_root {
            self.forward_up(frame, ReplyPath::Route(rid));
            return;
        }
        if self.init_granted {
            self.connector.transmit(
                rid,
                error_reply(
                    &frame,
                    &Error::Registration("the federation is already initializing".into()),
                ),
            );
            return;
        }
        if self.fed_names.contains_key(&frame.name) {
            self.connector.transmit(
                rid,
                error_reply(
                    &frame,
                    &Error::Registration(format!("duplicate federate name {}", frame.name)),
                ),
            );
            return;
        }
        let gfid = GlobalFederateId::new(self.next_fed_id);
        self.next_fed_id += 1;
        self.federates.insert(
            gfid,
            FedEntry {
                name: frame.name.clone(),
                synthetic: frame.has_flag(fflags::SYNTHETIC),
                disconnected: false,
            },
        );
        self.fed_names.insert(frame.name.clone(), gfid);
        self.routing.set(gfid, rid);
        tracing::info!(federate = %frame.name, id = %gfid, "federate registered");
        self.connector.transmit(
            rid,
            ControlFrame::new(Action::FederateAck)
                .dest_federate(gfid)
                .name(frame.name)
                .message_id(frame.message_id),
        );
    }

    /// An ack passing through an interior broker teaches it the federate's
    /// route before it continues downward.
    fn handle_federate_ack(&mut self, frame: ControlFrame) {
        if let Some((_, ReplyPath::Route(rid))) = self.forwards.get(&frame.message_id) {
            self.routing.set(frame.dest.federate, *rid);
        }
        self.forward_reply(frame);
    }

    fn handle_register_interface(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        if !self.is_root {
            if let Some(rid) = from {
                // Replies route by federate id, so no mapping is needed;
                // remember the federate's route on the way through.
                self.routing.set(frame.source.federate, rid);
            }
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        let reg: InterfaceReg = match bincode::deserialize(&frame.payload) {
            Ok(reg) => reg,
            Err(err) => {
                tracing::warn!("undecodable interface registration: {err}");
                return;
            }
        };
        let key = frame.name.clone();
        if self.interfaces.contains_key(&(reg.kind, key.clone())) {
            let reply = error_reply(
                &frame,
                &Error::Registration(format!("duplicate {} key {key}", reg.kind)),
            )
            .dest(frame.source);
            self.route_down(reply);
            return;
        }
        self.interfaces.insert(
            (reg.kind, key.clone()),
            InterfaceEntry {
                handle: frame.source,
                key: key.clone(),
                kind: reg.kind,
                cloning: reg.cloning,
            },
        );
        tracing::debug!(kind = %reg.kind, key = %key, owner = %frame.source, "interface registered");
        let ack = ControlFrame::new(Action::InterfaceAck)
            .dest(frame.source)
            .name(key)
            .message_id(frame.message_id);
        self.route_down(ack);

        self.retry_pending_targets();
        if matches!(reg.kind, InterfaceKind::Endpoint | InterfaceKind::Translator) {
            self.rebuild_edges();
        }
    }

    // ---- named-target resolution ----

    fn handle_add_target(&mut self, frame: ControlFrame) {
        if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        let request: TargetRequest = match bincode::deserialize(&frame.payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("undecodable target request: {err}");
                return;
            }
        };
        if !self.try_resolve_target(&request) {
            tracing::debug!(target = %request.target_name, "target not yet known; queued");
            self.pending_targets.push(request);
        }
    }

    fn lookup(&self, kinds: &[InterfaceKind], name: &str) -> Option<InterfaceEntry> {
        kinds
            .iter()
            .find_map(|&kind| self.interfaces.get(&(kind, name.to_owned())).cloned())
    }

    /// Attempt to resolve one named-target request; true when done.
    fn try_resolve_target(&mut self, request: &TargetRequest) -> bool {
        use InterfaceKind::*;
        let wanted: &[InterfaceKind] = match request.relationship {
            Relationship::PublicationToInput => {
                if request.origin_is_source {
                    &[Input, Translator]
                } else {
                    &[Publication, Translator]
                }
            }
            Relationship::EndpointToEndpoint => &[Endpoint, Translator],
            Relationship::SourceFilter
            | Relationship::DestinationFilter
            | Relationship::DeliveryEndpoint => &[Endpoint, Translator],
            Relationship::DefaultDestination => return true,
        };
        let Some(found) = self.lookup(wanted, &request.target_name) else {
            return false;
        };

        let origin_end = LinkEnd {
            handle: request.origin,
            key: request.origin_key.clone(),
            kind: request.origin_kind,
        };
        let found_end = LinkEnd {
            handle: found.handle,
            key: found.key.clone(),
            kind: found.kind,
        };
        let (source, target) = if request.origin_is_source {
            (origin_end, found_end)
        } else {
            (found_end, origin_end)
        };
        let cloning = match request.relationship {
            Relationship::SourceFilter
            | Relationship::DestinationFilter
            | Relationship::DeliveryEndpoint => self
                .interfaces
                .get(&(InterfaceKind::Filter, source.key.clone()))
                .map(|e| e.cloning)
                .unwrap_or(false),
            _ => false,
        };

        let record = LinkRecord {
            relationship: request.relationship,
            source: source.clone(),
            target: target.clone(),
            cloning,
        };
        tracing::debug!(
            relationship = ?record.relationship,
            source = %record.source.key,
            target = %record.target.key,
            "link resolved"
        );
        self.links.push(record);

        let notice = LinkNotice {
            relationship: request.relationship,
            source: source.clone(),
            target: target.clone(),
            cloning,
        };
        let payload = bincode::serialize(&notice).expect("link notice serializes");
        for fed in [source.handle.federate, target.handle.federate] {
            let frame = ControlFrame::new(Action::TargetLink)
                .dest_federate(fed)
                .payload(payload.clone());
            self.route_down(frame);
        }
        self.rebuild_edges();
        true
    }

    fn retry_pending_targets(&mut self) {
        let pending = std::mem::take(&mut self.pending_targets);
        for request in pending {
            if !self.try_resolve_target(&request) {
                self.pending_targets.push(request);
            }
        }
    }

    fn handle_filter_timing(&mut self, frame: ControlFrame) {
        if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        self.filter_shift.insert(frame.source, frame.time);
        self.rebuild_edges();
    }

    // ---- dependency-graph derivation ----

    /// Recompute the federate dependency graph from the interface graph
    /// and push changed edges to the owning cores.
    ///
    /// Message-capable federates are conservatively pairwise-coupled: any
    /// endpoint may address any other by name, so each such federate
    /// constrains every other. Filter hosts add detour edges carrying the
    /// chain's time shift; value links add directed publication edges.
    fn rebuild_edges(&mut self) {
        let mut graph: DiGraphMap<GlobalFederateId, Time> = DiGraphMap::new();
        let mut add = |graph: &mut DiGraphMap<GlobalFederateId, Time>,
                       from: GlobalFederateId,
                       to: GlobalFederateId,
                       delay: Time| {
            if from == to || !from.is_valid() || !to.is_valid() {
                return;
            }
            match graph.edge_weight_mut(from, to) {
                Some(existing) => {
                    if delay < *existing {
                        *existing = delay;
                    }
                }
                None => {
                    graph.add_edge(from, to, delay);
                }
            }
        };

        let message_feds: HashSet<GlobalFederateId> = self
            .interfaces
            .values()
            .filter(|e| matches!(e.kind, InterfaceKind::Endpoint | InterfaceKind::Translator))
            .map(|e| e.handle.federate)
            .filter(|f| f.is_valid())
            .collect();
        for &a in &message_feds {
            for &b in &message_feds {
                add(&mut graph, a, b, Time::ZERO);
            }
        }

        // Chain shift per filtered endpoint, per stage.
        let mut chain_shift: HashMap<(String, bool), Time> = HashMap::new();
        for link in &self.links {
            let dest_stage = match link.relationship {
                Relationship::SourceFilter => false,
                Relationship::DestinationFilter => true,
                _ => continue,
            };
            if link.cloning {
                continue;
            }
            let shift = self
                .filter_shift
                .get(&link.source.handle)
                .copied()
                .unwrap_or(Time::ZERO);
            let entry = chain_shift
                .entry((link.target.key.clone(), dest_stage))
                .or_insert(Time::ZERO);
            *entry = *entry + shift;
        }

        for link in &self.links {
            match link.relationship {
                Relationship::PublicationToInput => {
                    add(
                        &mut graph,
                        link.source.handle.federate,
                        link.target.handle.federate,
                        Time::ZERO,
                    );
                }
                Relationship::SourceFilter => {
                    let host = link.source.handle.federate;
                    let endpoint_fed = link.target.handle.federate;
                    add(&mut graph, endpoint_fed, host, Time::ZERO);
                    let shift = if link.cloning {
                        Time::ZERO
                    } else {
                        chain_shift
                            .get(&(link.target.key.clone(), false))
                            .copied()
                            .unwrap_or(Time::ZERO)
                    };
                    for &fed in &message_feds {
                        add(&mut graph, host, fed, shift);
                    }
                }
                Relationship::DestinationFilter => {
                    let host = link.source.handle.federate;
                    let endpoint_fed = link.target.handle.federate;
                    let shift = chain_shift
                        .get(&(link.target.key.clone(), true))
                        .copied()
                        .unwrap_or(Time::ZERO);
                    add(&mut graph, host, endpoint_fed, shift);
                    for &fed in &message_feds {
                        add(&mut graph, fed, host, Time::ZERO);
                    }
                }
                Relationship::DeliveryEndpoint => {
                    let host = link.source.handle.federate;
                    add(
                        &mut graph,
                        host,
                        link.target.handle.federate,
                        Time::ZERO,
                    );
                }
                Relationship::EndpointToEndpoint | Relationship::DefaultDestination => {}
            }
        }

        // Push changed edges to both sides.
        let mut fresh: HashMap<(GlobalFederateId, GlobalFederateId), Time> = HashMap::new();
        for (from, to, delay) in graph.all_edges() {
            fresh.insert((from, to), *delay);
        }
        for (&(from, to), &delay) in &fresh {
            if self.edges.get(&(from, to)) == Some(&delay) {
                continue;
            }
            let to_dep = DependencyNotice {
                partner: from,
                delay,
                dependency: true,
                dependent: false,
            };
            let frame = ControlFrame::new(Action::AddDependency)
                .dest_federate(to)
                .payload(bincode::serialize(&to_dep).expect("dependency notice serializes"));
            self.route_down(frame);

            let from_dep = DependencyNotice {
                partner: to,
                delay,
                dependency: false,
                dependent: true,
            };
            let frame = ControlFrame::new(Action::AddDependency)
                .dest_federate(from)
                .payload(bincode::serialize(&from_dep).expect("dependency notice serializes"));
            self.route_down(frame);
        }
        self.edges = fresh;
    }

    // ---- message-by-name resolution ----

    fn handle_message(&mut self, frame: ControlFrame) {
        if frame.dest.is_valid() {
            self.route_down(frame);
            return;
        }
        let found = self.lookup(
            &[InterfaceKind::Endpoint, InterfaceKind::Translator],
            &frame.name,
        );
        match found {
            Some(entry) => {
                let mut frame = frame;
                frame.dest = entry.handle;
                self.route_down(frame);
            }
            None if !self.is_root => self.connector.transmit(RouteId::PARENT, frame),
            None => {
                tracing::warn!(dest = %frame.name, "message for an unknown endpoint dropped");
            }
        }
    }

    // ---- barriers ----

    fn handle_init_ready(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        let child = GlobalBrokerId::new(frame.source.federate.raw());
        if from.is_some() && self.children.contains_key(&child) {
            self.init_ready.insert(child);
        }
        self.maybe_grant_init();
    }

    fn maybe_grant_init(&mut self) {
        if self.init_granted && self.is_root {
            return;
        }
        let connected: Vec<GlobalBrokerId> = self
            .children
            .iter()
            .filter(|(_, c)| !c.disconnected)
            .map(|(&id, _)| id)
            .collect();
        if connected.is_empty() || !connected.iter().all(|id| self.init_ready.contains(id)) {
            return;
        }
        if self.is_root {
            self.init_granted = true;
            // Final chance for queued lookups, then report what never
            // resolved.
            self.retry_pending_targets();
            for request in &self.pending_targets {
                tracing::warn!(
                    origin = %request.origin_key,
                    target = %request.target_name,
                    "named target never resolved"
                );
            }
            self.rebuild_edges();
            tracing::info!("all federates ready; granting initialization");
            self.broadcast(ControlFrame::new(Action::InitGrant));
        } else if !self.init_sent {
            self.init_sent = true;
            self.connector.transmit(
                RouteId::PARENT,
                ControlFrame::new(Action::InitReady)
                    .source_federate(self.base.global_id.as_federate()),
            );
        }
    }

    fn handle_exec_request(&mut self, frame: ControlFrame) {
        if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        let fed = frame.source.federate;
        if !self.federates.contains_key(&fed) {
            return;
        }
        self.exec_votes
            .insert(fed, IterationRequest::from_wire(frame.flags));
        self.maybe_grant_exec();
    }

    fn maybe_grant_exec(&mut self) {
        if self.exec_granted {
            return;
        }
        let expected: Vec<GlobalFederateId> = self
            .federates
            .iter()
            .filter(|(_, f)| !f.synthetic && !f.disconnected)
            .map(|(&id, _)| id)
            .collect();
        if expected.is_empty() || !expected.iter().all(|id| self.exec_votes.contains_key(id)) {
            return;
        }
        let iterate = expected
            .iter()
            .any(|id| self.exec_votes.get(id) == Some(&IterationRequest::ForceIteration));
        let round = self.exec_round;
        if iterate {
            tracing::debug!(round, "executing-mode barrier iterating");
            self.exec_votes.clear();
            self.exec_round = round.wrapping_add(1);
            let mut grant = ControlFrame::new(Action::ExecGrant).counter(round);
            grant.flags = 1;
            self.broadcast(grant);
        } else {
            tracing::info!("granting executing mode");
            self.exec_granted = true;
            self.broadcast(ControlFrame::new(Action::ExecGrant).counter(round));
        }
    }

    // ---- queries ----

    fn handle_query(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        let target = frame.name.clone();
        if target == self.base.name() || target == "broker" || (self.is_root && target == "root")
        {
            let json = self.broker_query(&frame.info);
            self.answer_query(from, frame, json);
            return;
        }
        // A federate or child node we know about?
        let down_route = self
            .fed_names
            .get(&target)
            .map(|fed| self.routing.get(*fed))
            .or_else(|| {
                self.children
                    .values()
                    .find(|c| !c.disconnected && c.name == target)
                    .map(|c| c.route)
            });
        let reply_to = match from {
            Some(rid) => ReplyPath::Route(rid),
            None => ReplyPath::Local(frame.message_id),
        };
        match down_route {
            Some(rid) => {
                self.next_forward_id = self.next_forward_id.wrapping_add(1);
                let local_id = self.next_forward_id;
                self.forwards.insert(local_id, (frame.message_id, reply_to));
                self.query_deadlines.push((
                    local_id,
                    tokio::time::Instant::now() + self.base.config.query_timeout,
                ));
                let mut down = frame;
                down.message_id = local_id;
                self.connector.transmit(rid, down);
            }
            None if !self.is_root => {
                self.query_deadlines.push((
                    frame.message_id,
                    tokio::time::Instant::now() + self.base.config.query_timeout,
                ));
                self.forward_up(frame, reply_to);
            }
            None => {
                let json =
                    serde_json::json!({ "error": format!("query target '{target}' not found") })
                        .to_string();
                self.answer_query(from, frame, json);
            }
        }
    }

    fn answer_query(&mut self, from: Option<RouteId>, frame: ControlFrame, json: String) {
        match from {
            Some(rid) => {
                let mut reply = ControlFrame::new(Action::QueryReply)
                    .message_id(frame.message_id)
                    .payload(json.into_bytes());
                reply.flags = frame.flags;
                self.connector.transmit(rid, reply);
            }
            None => {
                self.waiters.resolve(frame.message_id, Ok(Reply::Json(json)));
            }
        }
    }

    fn handle_query_reply(&mut self, frame: ControlFrame) {
        self.query_deadlines.retain(|(id, _)| *id != frame.message_id);
        if let Some((original, path)) = self.forwards.remove(&frame.message_id) {
            match path {
                ReplyPath::Route(rid) => {
                    let mut up = frame;
                    up.message_id = original;
                    self.connector.transmit(rid, up);
                }
                ReplyPath::Local(id) => {
                    self.waiters.resolve(
                        id,
                        Ok(Reply::Json(String::from_utf8_lossy(&frame.payload).into_owned())),
                    );
                }
            }
            return;
        }
        self.waiters.resolve(
            frame.message_id,
            Ok(Reply::Json(String::from_utf8_lossy(&frame.payload).into_owned())),
        );
    }

    fn broker_query(&self, query: &str) -> String {
        use serde_json::{json, Value};
        let value = match query {
            "name" => json!(self.base.name()),
            "exists" => json!(true),
            "isinit" => json!(self.init_granted),
            "federates" => Value::Array(
                self.federates
                    .values()
                    .filter(|f| !f.synthetic)
                    .map(|f| Value::String(f.name.clone()))
                    .collect(),
            ),
            "brokers" => Value::Array(
                self.children
                    .values()
                    .filter(|c| !c.disconnected)
                    .map(|c| Value::String(c.name.clone()))
                    .collect(),
            ),
            "interfaces" => Value::Array(
                self.interfaces
                    .values()
                    .map(|e| {
                        json!({
                            "key": e.key,
                            "kind": e.kind.to_string(),
                            "federate": e.handle.federate.raw(),
                        })
                    })
                    .collect(),
            ),
            "dependencies" => Value::Array(
                self.edges
                    .iter()
                    .map(|(&(from, to), delay)| {
                        json!({
                            "from": from.raw(),
                            "to": to.raw(),
                            "delay": delay.as_seconds(),
                        })
                    })
                    .collect(),
            ),
            _ => json!({ "error": format!("unrecognized broker query '{query}'") }),
        };
        value.to_string()
    }

    // ---- errors & teardown ----

    fn handle_local_error(&mut self, frame: ControlFrame) {
        if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        let fed = frame.source.federate;
        if let Some(entry) = self.federates.get_mut(&fed) {
            if entry.disconnected {
                return;
            }
            entry.disconnected = true;
        }
        self.exec_votes.remove(&fed);
        tracing::warn!(federate = %fed, code = frame.counter, message = %frame.info, "federate errored");
        self.broadcast(frame);
        self.maybe_grant_exec();
    }

    fn handle_global_error(&mut self, frame: ControlFrame) {
        if !self.is_root {
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        tracing::error!(code = frame.counter, message = %frame.info, "federation abort requested");
        let mut broadcasted = frame;
        broadcasted.flags |= fflags::GLOBAL_SCOPE;
        self.broadcast(broadcasted);
    }

    fn handle_disconnect(&mut self, from: Option<RouteId>, frame: ControlFrame) {
        let source = frame.source.federate;
        if !source.is_valid() {
            // Link-initiated shutdown of this broker.
            self.try_terminate(true);
            return;
        }
        if !self.is_root && from.is_some() && !self.children.contains_key(&GlobalBrokerId::new(source.raw())) && !source.is_broker() {
            // A federate disconnect on its way up; note it and forward.
            self.connector.transmit(RouteId::PARENT, frame);
            return;
        }
        if source.is_broker() {
            let child = GlobalBrokerId::new(source.raw());
            if let Some(entry) = self.children.get_mut(&child) {
                if !entry.disconnected {
                    entry.disconnected = true;
                    tracing::info!(child = %entry.name, "child disconnected");
                    let route = entry.route;
                    self.connector
                        .transmit(route, ControlFrame::new(Action::DisconnectAck));
                }
                self.init_ready.remove(&child);
                self.try_terminate(false);
                return;
            }
            if !self.is_root {
                self.connector.transmit(RouteId::PARENT, frame);
            }
            return;
        }
        // A federate left the federation.
        if self.is_root {
            if let Some(entry) = self.federates.get_mut(&source) {
                if entry.disconnected {
                    return;
                }
                entry.disconnected = true;
            }
            self.exec_votes.remove(&source);
            self.maybe_grant_exec();
            self.maybe_grant_init();
        } else {
            self.connector.transmit(RouteId::PARENT, frame);
        }
    }

    /// Shut down once every child has disconnected (or immediately when
    /// forced by the link).
    fn try_terminate(&mut self, forced: bool) {
        let all_gone = self.children.values().all(|c| c.disconnected);
        if !forced && !all_gone {
            return;
        }
        if !self.is_root && !forced {
            // Tell the parent we're leaving; terminate on its ack.
            if self.base.begin_terminate() {
                self.connector.transmit(
                    RouteId::PARENT,
                    ControlFrame::new(Action::Disconnect)
                        .source_federate(self.base.global_id.as_federate()),
                );
            }
            return;
        }
        self.base.begin_terminate();
        self.waiters
            .drain_with(|| Error::Connection("broker disconnected".into()));
        self.connector.broker_disconnect();
        self.base.signal_disconnected();
        tracing::info!(broker = %self.base.name(), "terminated");
    }

    fn handle_disconnect_ack(&mut self) {
        self.base.begin_terminate();
        self.waiters
            .drain_with(|| Error::Connection("broker disconnected".into()));
        self.connector.broker_disconnect();
        self.base.signal_disconnected();
    }

    fn handle_tick(&mut self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<u32> = self
            .query_deadlines
            .iter()
            .filter(|(_, deadline)| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        self.query_deadlines.retain(|(_, deadline)| *deadline > now);
        for id in expired {
            if let Some((original, path)) = self.forwards.remove(&id) {
                let json = serde_json::json!({ "error": "query timed out" }).to_string();
                match path {
                    ReplyPath::Route(rid) => {
                        self.connector.transmit(
                            rid,
                            ControlFrame::new(Action::QueryReply)
                                .message_id(original)
                                .payload(json.into_bytes()),
                        );
                    }
                    ReplyPath::Local(waiter) => {
                        self.waiters.resolve(waiter, Ok(Reply::Json(json)));
                    }
                }
            }
        }
    }
}

fn error_reply(frame: &ControlFrame, err: &Error) -> ControlFrame {
    ControlFrame::new(Action::ErrorReply)
        .message_id(frame.message_id)
        .counter(err.code())
        .info(err.to_string())
}
