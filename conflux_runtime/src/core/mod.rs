//! The core node: hosts local federates, owns their handle table, routes
//! messages and values, runs filter operators through a synthetic federate
//! and coordinates every local federate's time.
//!
//! All state in here is owned by a single command task; the public side
//! ([`CoreLink`]) posts commands and awaits replies.

mod filtering;
mod link;
mod process;

pub use link::{CoreLink, FederateHandle, TimeTicket};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use conflux_core::{
    GlobalFederateId, GlobalHandle, InterfaceHandle, LocalFederateId, RouteId, Time,
};

use crate::broker_base::{BaseConfig, BrokerBase, BrokerConnector, NodeMode};
use crate::command::{Command, SharedWaiters, Waiters};
use crate::federate::{FederateMode, FederateState};
use crate::frame::{ControlFrame, InterfaceKind};
use crate::handles::HandleManager;
use crate::interfaces::{
    EndpointInfo, FilterInfo, InputInfo, PublicationInfo, TranslatorInfo,
};
use crate::message::Message;
use crate::queue::{self, CommandReceiver, CommandSender};
use crate::routes::RouteTable;
use crate::timeout::TimeoutMonitor;

/// Suffix of the synthetic federate hosting filter/translator operators.
const OPERATOR_FED_SUFFIX: &str = "__operators";

/// One unit of pending operator work on the synthetic federate.
#[derive(Debug)]
pub(crate) enum FilterWork {
    /// Run an endpoint's filter chain over a message.
    Chain {
        time: Time,
        message: Box<Message>,
        endpoint_key: String,
        dest_stage: bool,
    },
    /// Encode a value through a translator and emit it as a message.
    TranslatorValue {
        time: Time,
        handle: InterfaceHandle,
        value: Vec<u8>,
    },
    /// Decode a message through a translator and publish it as a value.
    TranslatorMessage {
        time: Time,
        handle: InterfaceHandle,
        message: Box<Message>,
    },
}

impl FilterWork {
    pub(crate) fn time(&self) -> Time {
        match self {
            FilterWork::Chain { time, .. }
            | FilterWork::TranslatorValue { time, .. }
            | FilterWork::TranslatorMessage { time, .. } => *time,
        }
    }
}

pub struct Core {
    pub(crate) base: BrokerBase,
    pub(crate) connector: Box<dyn BrokerConnector>,
    pub(crate) waiters: SharedWaiters,
    /// Handle table; the write side lives on the command task, the read
    /// side serves public getters and fast queries.
    pub(crate) handles: Arc<RwLock<HandleManager>>,
    /// Mode snapshots for cheap state checks on the caller's thread.
    pub(crate) modes: Arc<RwLock<HashMap<LocalFederateId, FederateMode>>>,
    pub(crate) federates: Vec<FederateState>,
    pub(crate) fed_names: HashMap<String, LocalFederateId>,
    pub(crate) fed_globals: HashMap<GlobalFederateId, LocalFederateId>,
    pub(crate) routing: RouteTable,

    pub(crate) endpoints: HashMap<InterfaceHandle, EndpointInfo>,
    pub(crate) publications: HashMap<InterfaceHandle, PublicationInfo>,
    pub(crate) inputs: HashMap<InterfaceHandle, InputInfo>,
    pub(crate) filters: HashMap<InterfaceHandle, FilterInfo>,
    pub(crate) translators: HashMap<InterfaceHandle, TranslatorInfo>,
    /// Endpoint key → filter handles bound into its outbound path, in
    /// binding order. Maintained on the hosting core.
    pub(crate) source_chains: HashMap<String, Vec<InterfaceHandle>>,
    pub(crate) dest_chains: HashMap<String, Vec<InterfaceHandle>>,

    pub(crate) filter_fed: Option<LocalFederateId>,
    pub(crate) filter_work: Vec<FilterWork>,
    /// Interface registrations parked until the synthetic federate has an
    /// identity.
    pub(crate) pending_operator_regs: Vec<ControlFrame>,

    /// Names resolved through link notices, usable for direct routing.
    pub(crate) known_interfaces: HashMap<String, (GlobalHandle, InterfaceKind)>,
    /// message_id → locally created federate awaiting its ack.
    pub(crate) pending_fed_acks: HashMap<u32, LocalFederateId>,
    /// message_id → locally created interface awaiting its ack.
    pub(crate) pending_iface_acks: HashMap<u32, InterfaceHandle>,
    pub(crate) init_sent: bool,
    pub(crate) init_granted: bool,
    /// Federates holding the init barrier until explicit release.
    pub(crate) delay_init_holds: u32,
    pub(crate) exec_round: u16,
    pub(crate) message_counter: u32,
    pub(crate) query_deadlines: Vec<(u32, tokio::time::Instant)>,
    pub(crate) core_disconnect_sent: bool,
    pub(crate) global_error: Option<(i32, String)>,
}

impl Core {
    /// Spawn a core's command task. The connector factory receives the
    /// core's ingress sender so the transport can wire the reverse path.
    /// The core is not connected until [`CoreLink::connect`] completes the
    /// hello exchange with the parent.
    pub fn spawn(
        config: BaseConfig,
        connector: impl FnOnce(CommandSender) -> Box<dyn BrokerConnector>,
    ) -> CoreLink {
        let (sender, receiver) = queue::channel();
        let connector = connector(sender.clone());
        let waiters: SharedWaiters = Arc::new(Waiters::default());
        let handles = Arc::new(RwLock::new(HandleManager::default()));
        let modes = Arc::new(RwLock::new(HashMap::new()));

        let monitor = TimeoutMonitor::spawn(sender.clone(), config.tick_period);
        let base = BrokerBase::new(config, sender.clone());
        let disconnect = base.disconnect_watch();

        let core = Core {
            base,
            connector,
            waiters: waiters.clone(),
            handles: handles.clone(),
            modes: modes.clone(),
            federates: Vec::new(),
            fed_names: HashMap::new(),
            fed_globals: HashMap::new(),
            routing: RouteTable::default(),
            endpoints: HashMap::new(),
            publications: HashMap::new(),
            inputs: HashMap::new(),
            filters: HashMap::new(),
            translators: HashMap::new(),
            source_chains: HashMap::new(),
            dest_chains: HashMap::new(),
            filter_fed: None,
            filter_work: Vec::new(),
            pending_operator_regs: Vec::new(),
            known_interfaces: HashMap::new(),
            pending_fed_acks: HashMap::new(),
            pending_iface_acks: HashMap::new(),
            init_sent: false,
            init_granted: false,
            delay_init_holds: 0,
            exec_round: 0,
            message_counter: 0,
            query_deadlines: Vec::new(),
            core_disconnect_sent: false,
            global_error: None,
        };

        let link_config = core.base.config.clone();
        tokio::spawn(async move {
            core.run(receiver).await;
            monitor.abort();
        });

        CoreLink::new(link_config, sender, waiters, handles, modes, disconnect)
    }

    #[tracing::instrument(skip(self, receiver), fields(core = %self.base.name()))]
    async fn run(mut self, mut receiver: CommandReceiver) {
        tracing::info!("core command loop starting");
        while let Some(command) = receiver.next().await {
            match command {
                Command::Frame(frame) | Command::Routed { frame, .. } => {
                    self.handle_frame(frame)
                }
                Command::Read(request) => self.handle_read(request),
                Command::SetFilterOperator { handle, operator } => {
                    self.set_filter_operator(handle, operator)
                }
                Command::SetTranslatorOperator { handle, operator } => {
                    self.set_translator_operator(handle, operator)
                }
                Command::Reconfigure { config, reply } => {
                    let result = self
                        .base
                        .reconfigure(config)
                        .map(|_| crate::command::Reply::Ack);
                    let _ = reply.send(result);
                }
            }
            if self.base.mode == NodeMode::Terminated {
                break;
            }
        }
        tracing::info!("core command loop exited");
    }

    // ---- small shared helpers used across the submodules ----

    pub(crate) fn fed(&self, local: LocalFederateId) -> Option<&FederateState> {
        local
            .raw()
            .checked_sub(1)
            .and_then(|i| self.federates.get(i as usize))
    }

    pub(crate) fn fed_mut(&mut self, local: LocalFederateId) -> Option<&mut FederateState> {
        local
            .raw()
            .checked_sub(1)
            .and_then(|i| self.federates.get_mut(i as usize))
    }

    pub(crate) fn fed_by_global(&self, global: GlobalFederateId) -> Option<LocalFederateId> {
        self.fed_globals.get(&global).copied()
    }

    pub(crate) fn set_mode(&mut self, local: LocalFederateId, mode: FederateMode) {
        self.modes.write().unwrap().insert(local, mode);
        if let Some(fed) = self.fed_mut(local) {
            fed.mode = mode;
        }
    }

    pub(crate) fn next_message_id(&mut self) -> u32 {
        self.message_counter = self.message_counter.wrapping_add(1);
        self.message_counter
    }

    /// Send a frame on its way: local destinations are re-enqueued on our
    /// own ingress (keeping one-frame-at-a-time semantics), everything else
    /// goes out a route.
    pub(crate) fn route_frame(&mut self, frame: ControlFrame) {
        let dest_fed = frame.dest.federate;
        if dest_fed.is_valid() && self.fed_globals.contains_key(&dest_fed) {
            if self.base.sender.send(Command::Frame(frame)).is_err() {
                tracing::warn!("own ingress closed while routing a local frame");
            }
            return;
        }
        let rid = if dest_fed.is_valid() {
            self.routing.get(dest_fed)
        } else {
            RouteId::PARENT
        };
        self.connector.transmit(rid, frame);
    }

    /// Send a frame towards the parent broker.
    pub(crate) fn transmit_parent(&self, frame: ControlFrame) {
        self.connector.transmit(RouteId::PARENT, frame);
    }
}
