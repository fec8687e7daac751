//! The public side of a core: a cheap handle that posts command frames and
//! awaits replies. No user logic ever runs on the command task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{oneshot, watch};

use conflux_core::flags::{frame as fflags, FederateFlags};
use conflux_core::{
    GlobalFederateId, GlobalHandle, InterfaceHandle, IterationRequest, IterationResult,
    LocalFederateId, Time,
};

use crate::broker_base::BaseConfig;
use crate::command::{Command, ReadKind, ReadRequest, Reply, SharedWaiters};
use crate::coordination::TimeProperties;
use crate::errors::Error;
use crate::federate::FederateMode;
use crate::frame::{
    Action, ControlFrame, FederateReg, InterfaceKind, InterfaceReg, Relationship, TargetRequest,
};
use crate::handles::HandleManager;
use crate::interfaces::{FilterOperator, TranslatorOperator};
use crate::message::Message;
use crate::query::Sequencing;
use crate::queue::CommandSender;

struct LinkInner {
    config: BaseConfig,
    sender: CommandSender,
    waiters: SharedWaiters,
    handles: Arc<RwLock<HandleManager>>,
    modes: Arc<RwLock<HashMap<LocalFederateId, FederateMode>>>,
    disconnect: watch::Receiver<bool>,
}

/// Handle to a running core.
#[derive(Clone)]
pub struct CoreLink {
    inner: Arc<LinkInner>,
}

/// An in-flight asynchronous time request.
pub struct TimeTicket {
    rx: oneshot::Receiver<Result<Reply, Error>>,
}

impl TimeTicket {
    /// Block until the kernel resolves the request.
    pub async fn complete(self) -> Result<(Time, IterationResult), Error> {
        match self
            .rx
            .await
            .map_err(|_| Error::Connection("core disconnected".into()))??
        {
            Reply::TimeGrant { time, result, .. } => Ok((time, result)),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to a time request"
            ))),
        }
    }
}

impl CoreLink {
    pub(crate) fn new(
        config: BaseConfig,
        sender: CommandSender,
        waiters: SharedWaiters,
        handles: Arc<RwLock<HandleManager>>,
        modes: Arc<RwLock<HashMap<LocalFederateId, FederateMode>>>,
        disconnect: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                sender,
                waiters,
                handles,
                modes,
                disconnect,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn post(&self, frame: ControlFrame) -> Result<(), Error> {
        self.inner
            .sender
            .send(Command::Frame(frame))
            .map_err(|_| Error::Connection("core command queue closed".into()))
    }

    fn begin(&self, mut frame: ControlFrame) -> Result<oneshot::Receiver<Result<Reply, Error>>, Error> {
        let (id, rx) = self.inner.waiters.register();
        frame.message_id = id;
        match self.post(frame) {
            Ok(()) => Ok(rx),
            Err(err) => {
                self.inner.waiters.forget(id);
                Err(err)
            }
        }
    }

    async fn roundtrip(&self, frame: ControlFrame) -> Result<Reply, Error> {
        let rx = self.begin(frame)?;
        rx.await
            .map_err(|_| Error::Connection("core disconnected".into()))?
    }

    async fn read(&self, kind: ReadKind) -> Result<Reply, Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .sender
            .send(Command::Read(ReadRequest { kind, reply: tx }))
            .map_err(|_| Error::Connection("core command queue closed".into()))?;
        rx.await
            .map_err(|_| Error::Connection("core disconnected".into()))?
    }

    fn mode_of(&self, local: LocalFederateId) -> FederateMode {
        self.inner
            .modes
            .read()
            .unwrap()
            .get(&local)
            .copied()
            .unwrap_or(FederateMode::Created)
    }

    /// Replace the base configuration; fails once connected.
    pub async fn configure(&self, config: BaseConfig) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .sender
            .send(Command::Reconfigure { config, reply: tx })
            .map_err(|_| Error::Connection("core command queue closed".into()))?;
        rx.await
            .map_err(|_| Error::Connection("core disconnected".into()))?
            .map(|_| ())
    }

    /// Bring the core up: transport connect plus the identity hello to the
    /// parent. Idempotent; fails with a connection error on timeout.
    pub async fn connect(&self) -> Result<(), Error> {
        let rx = self.begin(ControlFrame::new(Action::Hello))?;
        match tokio::time::timeout(self.inner.config.connect_timeout, rx).await {
            Ok(reply) => reply
                .map_err(|_| Error::Connection("core disconnected".into()))?
                .map(|_| ()),
            Err(_) => Err(Error::Connection(format!(
                "no identity assigned within {:?}",
                self.inner.config.connect_timeout
            ))),
        }
    }

    /// Register a federate on this core. Completes once the root broker
    /// assigns its federation-wide identity.
    pub async fn register_federate(
        &self,
        name: &str,
        props: TimeProperties,
        flags: FederateFlags,
    ) -> Result<FederateHandle, Error> {
        let reg = FederateReg {
            props,
            flags,
            synthetic: false,
        };
        let frame = ControlFrame::new(Action::RegisterFederate)
            .name(name)
            .payload(bincode::serialize(&reg).map_err(|e| Error::Other(e.into()))?);
        match self.roundtrip(frame).await? {
            Reply::Federate { local, global } => Ok(FederateHandle {
                link: self.clone(),
                name: name.to_owned(),
                local,
                global,
            }),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to federate registration"
            ))),
        }
    }

    /// Release the delayed-init hold, letting the init barrier proceed.
    pub async fn set_ready_to_init(&self) -> Result<(), Error> {
        self.roundtrip(ControlFrame::new(Action::InitReady)).await.map(|_| ())
    }

    /// Issue a query. `Fast` answers static queries out of band; `Ordered`
    /// goes through the command loop, strictly ordered with state changes.
    pub async fn query(
        &self,
        target: &str,
        query: &str,
        mode: Sequencing,
    ) -> Result<String, Error> {
        if mode == Sequencing::Fast && (target == self.name() || target == "core") {
            match query {
                "name" => return Ok(format!("\"{}\"", self.name())),
                "exists" => return Ok("true".into()),
                _ => {}
            }
        }
        let mut frame = ControlFrame::new(Action::Query).name(target).info(query);
        if mode == Sequencing::Fast {
            frame = frame.flag(fflags::FAST);
        }
        match self.roundtrip(frame).await? {
            Reply::Json(json) => Ok(json),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to a query"
            ))),
        }
    }

    /// Tear the core down. Idempotent; pending calls wake with a
    /// connection failure.
    pub async fn disconnect(&self) {
        let _ = self.post(ControlFrame::new(Action::Disconnect));
        self.wait_for_disconnect().await;
    }

    /// Block until the core has fully disconnected.
    pub async fn wait_for_disconnect(&self) {
        let mut watch = self.inner.disconnect.clone();
        while !*watch.borrow() {
            if watch.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        *self.inner.disconnect.borrow()
    }
}

/// A registered federate bound to its core.
#[derive(Clone)]
pub struct FederateHandle {
    link: CoreLink,
    name: String,
    local: LocalFederateId,
    global: GlobalFederateId,
}

impl std::fmt::Debug for FederateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederateHandle")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("global", &self.global)
            .finish()
    }
}

impl FederateHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_id(&self) -> LocalFederateId {
        self.local
    }

    pub fn global_id(&self) -> GlobalFederateId {
        self.global
    }

    pub fn core(&self) -> &CoreLink {
        &self.link
    }

    pub fn mode(&self) -> FederateMode {
        self.link.mode_of(self.local)
    }

    fn check_registration_mode(&self) -> Result<(), Error> {
        match self.mode() {
            FederateMode::Created | FederateMode::Initializing => Ok(()),
            mode => Err(Error::InvalidState(format!(
                "interfaces cannot be created in the {mode} mode"
            ))),
        }
    }

    async fn register_interface(
        &self,
        kind: InterfaceKind,
        key: &str,
        type_name: &str,
        units: &str,
        global: bool,
        cloning: bool,
    ) -> Result<(InterfaceHandle, GlobalHandle), Error> {
        self.check_registration_mode()?;
        let reg = InterfaceReg {
            kind,
            type_name: type_name.to_owned(),
            units: units.to_owned(),
            global,
            cloning,
        };
        let mut frame = ControlFrame::new(Action::RegisterInterface)
            .source_federate(self.global)
            .name(key)
            .payload(bincode::serialize(&reg).map_err(|e| Error::Other(e.into()))?);
        if global {
            frame = frame.flag(fflags::GLOBAL_KEY);
        }
        match self.link.roundtrip(frame).await? {
            Reply::Interface { handle, global } => Ok((handle, global)),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to interface registration"
            ))),
        }
    }

    pub async fn register_publication(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Publication, key, type_name, units, false, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_global_publication(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Publication, key, type_name, units, true, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_input(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Input, key, type_name, units, false, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_global_input(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Input, key, type_name, units, true, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_endpoint(
        &self,
        key: &str,
        type_name: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Endpoint, key, type_name, "", false, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_global_endpoint(
        &self,
        key: &str,
        type_name: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Endpoint, key, type_name, "", true, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_filter(&self, key: &str) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Filter, key, "", "", true, false)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_cloning_filter(&self, key: &str) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Filter, key, "", "", true, true)
            .await
            .map(|(h, _)| h)
    }

    pub async fn register_translator(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, Error> {
        self.register_interface(InterfaceKind::Translator, key, type_name, units, true, false)
            .await
            .map(|(h, _)| h)
    }

    fn target_request(
        &self,
        relationship: Relationship,
        handle: InterfaceHandle,
        target: &str,
        origin_is_source: bool,
    ) -> Result<(), Error> {
        let (origin, origin_key, origin_kind) = {
            let handles = self.link.inner.handles.read().unwrap();
            let info = handles.get(handle).ok_or_else(|| {
                Error::InvalidIdentifier(format!("unknown interface handle {handle}"))
            })?;
            (info.global_handle(), info.key.clone(), info.kind)
        };
        let request = TargetRequest {
            relationship,
            origin,
            origin_key,
            origin_kind,
            target_name: target.to_owned(),
            origin_is_source,
        };
        let frame = ControlFrame::new(Action::AddTarget)
            .source(origin.federate, origin.handle)
            .name(target)
            .payload(bincode::serialize(&request).map_err(|e| Error::Other(e.into()))?);
        self.link.post(frame)
    }

    /// Subscribe an input (or a translator's input side) to a named
    /// publication.
    pub fn add_publication_source(
        &self,
        input: InterfaceHandle,
        publication: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::PublicationToInput, input, publication, false)
    }

    /// Point a publication at a named input.
    pub fn add_value_target(
        &self,
        publication: InterfaceHandle,
        input: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::PublicationToInput, publication, input, true)
    }

    /// Add a destination endpoint for messages sent from `endpoint`.
    pub fn add_destination_target(
        &self,
        endpoint: InterfaceHandle,
        dest: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::EndpointToEndpoint, endpoint, dest, true)
    }

    /// Record a named source endpoint for an endpoint.
    pub fn add_source_target(
        &self,
        endpoint: InterfaceHandle,
        source: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::EndpointToEndpoint, endpoint, source, false)
    }

    /// Bind a filter into the outbound path of a named endpoint.
    pub fn add_filter_source_target(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::SourceFilter, filter, endpoint, true)
    }

    /// Bind a filter into the inbound path of a named endpoint.
    pub fn add_filter_destination_target(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::DestinationFilter, filter, endpoint, true)
    }

    /// Add a delivery endpoint to a cloning filter.
    pub fn add_delivery_endpoint(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::DeliveryEndpoint, filter, endpoint, true)
    }

    /// Set the destination used by `send` when none is named.
    pub fn set_default_destination(
        &self,
        endpoint: InterfaceHandle,
        dest: &str,
    ) -> Result<(), Error> {
        self.target_request(Relationship::DefaultDestination, endpoint, dest, true)
    }

    pub fn set_filter_operator(
        &self,
        filter: InterfaceHandle,
        operator: Option<Arc<dyn FilterOperator>>,
    ) -> Result<(), Error> {
        self.link
            .inner
            .sender
            .send(Command::SetFilterOperator {
                handle: filter,
                operator,
            })
            .map_err(|_| Error::Connection("core command queue closed".into()))
    }

    pub fn set_translator_operator(
        &self,
        translator: InterfaceHandle,
        operator: Option<Arc<dyn TranslatorOperator>>,
    ) -> Result<(), Error> {
        self.link
            .inner
            .sender
            .send(Command::SetTranslatorOperator {
                handle: translator,
                operator,
            })
            .map_err(|_| Error::Connection("core command queue closed".into()))
    }

    // ---- lifecycle ----

    /// Declare readiness for initialization and block until the root
    /// broker grants it federation-wide.
    pub async fn enter_initializing_mode(&self) -> Result<(), Error> {
        let frame = ControlFrame::new(Action::InitReady).source_federate(self.global);
        self.link.roundtrip(frame).await.map(|_| ())
    }

    /// Request executing mode; participates in the federation-wide barrier.
    pub async fn enter_executing_mode(
        &self,
        iterate: IterationRequest,
    ) -> Result<IterationResult, Error> {
        let mut frame = ControlFrame::new(Action::ExecRequest).source_federate(self.global);
        frame.flags = iterate.wire();
        match self.link.roundtrip(frame).await? {
            Reply::Exec { result } => Ok(result),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected reply {other:?} to an exec request"
            ))),
        }
    }

    /// Request a time advance, blocking until granted.
    pub async fn request_time(&self, time: Time) -> Result<Time, Error> {
        self.request_time_iterative(time, IterationRequest::NoIteration)
            .await
            .map(|(granted, _)| granted)
    }

    pub async fn request_time_iterative(
        &self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<(Time, IterationResult), Error> {
        self.request_time_async(time, iterate)?.complete().await
    }

    /// Submit a time request and return a ticket for later completion.
    pub fn request_time_async(
        &self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<TimeTicket, Error> {
        let mut frame = ControlFrame::new(Action::RequestTime)
            .source_federate(self.global)
            .time(time);
        frame.counter = iterate.wire();
        let rx = self.link.begin(frame)?;
        Ok(TimeTicket { rx })
    }

    /// Close one interface: it is tombstoned and no further traffic flows
    /// through it. The handle is never reused.
    pub async fn close_interface(&self, handle: InterfaceHandle) -> Result<(), Error> {
        let frame = ControlFrame::new(Action::Disconnect).source(self.global, handle);
        self.link.roundtrip(frame).await.map(|_| ())
    }

    /// Finalize the federate. Always succeeds; idempotent, including after
    /// an error state or a core teardown.
    pub async fn finalize(&self) -> Result<(), Error> {
        let frame = ControlFrame::new(Action::Disconnect).source_federate(self.global);
        match self.link.roundtrip(frame).await {
            Ok(_) | Err(Error::Connection(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Put this federate into the error state.
    pub fn local_error(&self, code: i32, message: &str) -> Result<(), Error> {
        let mut frame = ControlFrame::new(Action::LocalError)
            .source_federate(self.global)
            .info(message);
        frame.counter = code as u16;
        self.link.post(frame)
    }

    /// Abort the whole federation.
    pub fn global_error(&self, code: i32, message: &str) -> Result<(), Error> {
        let mut frame = ControlFrame::new(Action::GlobalError)
            .source_federate(self.global)
            .info(message);
        frame.counter = code as u16;
        self.link.post(frame)
    }

    // ---- values ----

    pub fn publish(&self, publication: InterfaceHandle, data: &[u8]) -> Result<(), Error> {
        match self.mode() {
            FederateMode::Executing | FederateMode::Initializing => {}
            mode => {
                return Err(Error::InvalidState(format!(
                    "cannot publish in the {mode} mode"
                )))
            }
        }
        let frame = ControlFrame::new(Action::Publish)
            .source(self.global, publication)
            .payload(data.to_vec());
        self.link.post(frame)
    }

    pub async fn get_value(&self, input: InterfaceHandle) -> Result<Option<Vec<u8>>, Error> {
        match self
            .link
            .read(ReadKind::Value {
                federate: self.local,
                handle: input,
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    pub fn set_default_value(&self, input: InterfaceHandle, data: &[u8]) -> Result<(), Error> {
        let frame = ControlFrame::new(Action::SetValue)
            .dest(GlobalHandle::new(self.global, input))
            .flag(fflags::INTERNAL)
            .payload(data.to_vec());
        self.link.post(frame)
    }

    pub async fn is_updated(&self, input: InterfaceHandle) -> Result<bool, Error> {
        match self
            .link
            .read(ReadKind::InputUpdated {
                federate: self.local,
                handle: input,
            })
            .await?
        {
            Reply::Flag(updated) => Ok(updated),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    // ---- messages ----

    fn check_send_mode(&self) -> Result<(), Error> {
        match self.mode() {
            FederateMode::Executing => Ok(()),
            mode => Err(Error::InvalidState(format!(
                "cannot send in the {mode} mode"
            ))),
        }
    }

    /// Send to the endpoint's configured targets (or default destination).
    pub fn send(&self, endpoint: InterfaceHandle, payload: &[u8]) -> Result<(), Error> {
        self.check_send_mode()?;
        let frame = ControlFrame::new(Action::Send)
            .source(self.global, endpoint)
            .time(Time::MIN_VALUE)
            .payload(payload.to_vec());
        self.link.post(frame)
    }

    /// Send with an explicit delivery time; the stamp is the later of the
    /// explicit time and current time plus the output delay.
    pub fn send_at(
        &self,
        endpoint: InterfaceHandle,
        payload: &[u8],
        time: Time,
    ) -> Result<(), Error> {
        self.check_send_mode()?;
        let frame = ControlFrame::new(Action::Send)
            .source(self.global, endpoint)
            .time(time)
            .payload(payload.to_vec());
        self.link.post(frame)
    }

    /// Send to a named endpoint.
    pub fn send_to(
        &self,
        endpoint: InterfaceHandle,
        payload: &[u8],
        dest: &str,
    ) -> Result<(), Error> {
        self.check_send_mode()?;
        let frame = ControlFrame::new(Action::Send)
            .source(self.global, endpoint)
            .name(dest)
            .time(Time::MIN_VALUE)
            .payload(payload.to_vec());
        self.link.post(frame)
    }

    pub fn send_to_at(
        &self,
        endpoint: InterfaceHandle,
        payload: &[u8],
        dest: &str,
        time: Time,
    ) -> Result<(), Error> {
        self.check_send_mode()?;
        let frame = ControlFrame::new(Action::Send)
            .source(self.global, endpoint)
            .name(dest)
            .time(time)
            .payload(payload.to_vec());
        self.link.post(frame)
    }

    /// Pop the next available message on an endpoint.
    pub async fn receive(&self, endpoint: InterfaceHandle) -> Result<Option<Message>, Error> {
        match self
            .link
            .read(ReadKind::NextMessage {
                federate: self.local,
                handle: endpoint,
            })
            .await?
        {
            Reply::Message(message) => Ok(message.map(|m| *m)),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    /// Pop the earliest available message on any of this federate's
    /// endpoints.
    pub async fn receive_any(
        &self,
    ) -> Result<Option<(InterfaceHandle, Message)>, Error> {
        match self
            .link
            .read(ReadKind::NextMessageAny {
                federate: self.local,
            })
            .await?
        {
            Reply::MessageAny(result) => Ok(result.map(|(h, m)| (h, *m))),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    pub async fn pending_count(&self, endpoint: InterfaceHandle) -> Result<u64, Error> {
        match self
            .link
            .read(ReadKind::PendingCount {
                federate: self.local,
                handle: endpoint,
            })
            .await?
        {
            Reply::Count(count) => Ok(count),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    pub async fn pending_count_any(&self) -> Result<u64, Error> {
        match self
            .link
            .read(ReadKind::PendingCountAny {
                federate: self.local,
            })
            .await?
        {
            Reply::Count(count) => Ok(count),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    pub async fn current_time(&self) -> Result<Time, Error> {
        match self
            .link
            .read(ReadKind::CurrentTime {
                federate: self.local,
            })
            .await?
        {
            Reply::Time(time) => Ok(time),
            other => Err(Error::Other(anyhow::anyhow!("unexpected reply {other:?}"))),
        }
    }

    /// Query through this federate's core.
    pub async fn query(&self, target: &str, query: &str) -> Result<String, Error> {
        self.link.query(target, query, Sequencing::Ordered).await
    }
}
