//! Frame and command processing for the core's command task.

use conflux_core::flags::frame as fflags;
use conflux_core::{
    GlobalFederateId, GlobalHandle, InterfaceHandle, IterationRequest, IterationResult,
    LocalFederateId, Time,
};

use crate::broker_base::NodeMode;
use crate::command::{ReadKind, ReadRequest, Reply};
use crate::coordination::GrantOutcome;
use crate::errors::Error;
use crate::federate::{FederateMode, FederateState, PendingExec, PendingTime};
use crate::frame::{
    Action, ControlFrame, DependencyNotice, FederateReg, InterfaceKind, InterfaceReg,
    LinkNotice, Relationship, TimingUpdate,
};
use crate::handles::qualify_key;
use crate::message::Message;

use super::{Core, FilterWork};

impl Core {
    pub(crate) fn handle_frame(&mut self, frame: ControlFrame) {
        tracing::trace!(core = %self.base.name(), action = ?frame.action, "processing frame");
        match frame.action {
            Action::Hello => self.handle_connect(frame),
            Action::HelloAck => self.handle_hello_ack(frame),
            Action::HelloReject => {
                self.waiters
                    .resolve(frame.message_id, Err(Error::Connection(frame.info)));
            }
            Action::RegisterFederate => self.handle_register_federate(frame),
            Action::FederateAck => self.handle_federate_ack(frame),
            Action::RegisterInterface => self.handle_register_interface(frame),
            Action::InterfaceAck => self.handle_interface_ack(frame),
            Action::ErrorReply => self.handle_error_reply(frame),
            Action::AddTarget => self.handle_add_target(frame),
            Action::TargetLink => self.handle_target_link(frame),
            Action::AddDependency => self.handle_add_dependency(frame),
            Action::FilterTiming => {}
            Action::InitReady => self.handle_init_ready(frame),
            Action::InitGrant => self.handle_init_grant(),
            Action::ExecRequest => self.handle_exec_request(frame),
            Action::ExecGrant => self.handle_exec_grant(frame),
            Action::RequestTime => self.handle_request_time(frame),
            Action::TimeUpdate | Action::TimeGrant => self.handle_time_update(frame),
            Action::Message => self.dispatch_message(frame),
            Action::SetValue => self.handle_set_value(frame),
            Action::Publish => self.handle_publish(frame),
            Action::Send => self.handle_send(frame),
            Action::Query => self.handle_query(frame),
            Action::QueryReply => self.handle_query_reply(frame),
            Action::LocalError => self.handle_local_error(frame),
            Action::GlobalError => self.handle_global_error(frame),
            Action::Disconnect => self.handle_disconnect(frame),
            Action::DisconnectAck => self.handle_disconnect_ack(),
            Action::Ping => {
                self.transmit_parent(ControlFrame::new(Action::Pong).message_id(frame.message_id));
            }
            Action::Pong => {}
            Action::Tick => self.handle_tick(),
        }
    }

    // ---- connection ----

    fn handle_connect(&mut self, frame: ControlFrame) {
        match self.base.mode {
            NodeMode::Created => {
                if let Err(err) = self.connector.broker_connect() {
                    self.waiters.resolve(frame.message_id, Err(err));
                    return;
                }
                self.base.mode = NodeMode::Connecting;
                let hello = ControlFrame::new(Action::Hello)
                    .name(self.base.name().to_owned())
                    .message_id(frame.message_id);
                self.transmit_parent(hello);
            }
            NodeMode::Connecting | NodeMode::Connected | NodeMode::Operating => {
                // connect() is idempotent once up.
                self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
            }
            _ => {
                self.waiters.resolve(
                    frame.message_id,
                    Err(Error::Connection("core is shutting down".into())),
                );
            }
        }
    }

    fn handle_hello_ack(&mut self, frame: ControlFrame) {
        self.base.global_id = conflux_core::GlobalBrokerId::new(frame.dest.federate.raw());
        self.base.mode = NodeMode::Operating;
        tracing::info!(core = %self.base.name(), id = %self.base.global_id, "joined federation");
        self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
    }

    fn core_id(&self) -> GlobalFederateId {
        self.base.global_id.as_federate()
    }

    // ---- federate registration ----

    fn handle_register_federate(&mut self, frame: ControlFrame) {
        if self.base.mode != NodeMode::Operating {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState("core is not connected".into())),
            );
            return;
        }
        let reg: FederateReg = match bincode::deserialize(&frame.payload) {
            Ok(reg) => reg,
            Err(err) => {
                self.waiters
                    .resolve(frame.message_id, Err(Error::Other(err.into())));
                return;
            }
        };
        if self.fed_names.contains_key(&frame.name) {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::Registration(format!(
                    "a federate named {} already exists on this core",
                    frame.name
                ))),
            );
            return;
        }

        let local = LocalFederateId::new(self.federates.len() as u32 + 1);
        if reg.flags.delay_init_entry {
            self.delay_init_holds += 1;
        }
        let fed = FederateState::new(&frame.name, local, reg.props, reg.flags, reg.synthetic);
        self.federates.push(fed);
        self.fed_names.insert(frame.name.clone(), local);
        self.modes.write().unwrap().insert(local, FederateMode::Created);
        self.pending_fed_acks.insert(frame.message_id, local);

        let mut upward = ControlFrame::new(Action::RegisterFederate)
            .name(frame.name)
            .message_id(frame.message_id);
        if reg.synthetic {
            upward = upward.flag(fflags::SYNTHETIC);
        }
        self.transmit_parent(upward);
    }

    fn handle_federate_ack(&mut self, frame: ControlFrame) {
        let Some(local) = self.pending_fed_acks.remove(&frame.message_id) else {
            return;
        };
        let global = frame.dest.federate;
        self.fed_globals.insert(global, local);
        self.handles.write().unwrap().set_global_federate(local, global);
        if let Some(fed) = self.fed_mut(local) {
            fed.global_id = global;
            fed.coordinator.set_id(global);
        }
        tracing::debug!(core = %self.base.name(), federate = %global, "federate registered");
        self.waiters
            .resolve(frame.message_id, Ok(Reply::Federate { local, global }));

        if self.filter_fed == Some(local) {
            let parked = std::mem::take(&mut self.pending_operator_regs);
            for reg in parked {
                self.handle_register_interface(reg);
            }
        }
    }

    // ---- interface registration ----

    pub(crate) fn handle_register_interface(&mut self, frame: ControlFrame) {
        let reg: InterfaceReg = match bincode::deserialize(&frame.payload) {
            Ok(reg) => reg,
            Err(err) => {
                self.waiters
                    .resolve(frame.message_id, Err(Error::Other(err.into())));
                return;
            }
        };
        let Some(owner) = self.fed_by_global(frame.source.federate) else {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidIdentifier(format!(
                    "unknown federate {}",
                    frame.source.federate
                ))),
            );
            return;
        };
        let fed_name = self.fed(owner).map(|f| f.name.clone()).unwrap_or_default();
        let fed_mode = self.fed(owner).map(|f| f.mode).unwrap_or(FederateMode::Created);
        if !matches!(fed_mode, FederateMode::Created | FederateMode::Initializing) {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState(format!(
                    "interfaces cannot be created in the {fed_mode} mode"
                ))),
            );
            return;
        }

        // Filters and translators live on the synthetic operator federate.
        let host_local = match reg.kind {
            InterfaceKind::Filter | InterfaceKind::Translator => {
                match self.operator_fed_ready() {
                    Some(local) => local,
                    None => {
                        // Identity for the operator federate is still in
                        // flight; park the registration.
                        self.pending_operator_regs.push(frame);
                        return;
                    }
                }
            }
            _ => owner,
        };
        let host_global = self.fed(host_local).map(|f| f.global_id).unwrap_or_default();

        let key = if reg.global {
            frame.name.clone()
        } else {
            qualify_key(&fed_name, &frame.name)
        };

        if self.handles.read().unwrap().find(reg.kind, &key).is_some() {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::Registration(format!(
                    "duplicate {} key {key}",
                    reg.kind
                ))),
            );
            return;
        }

        let handle = self.handles.write().unwrap().create(
            host_local,
            host_global,
            reg.kind,
            &key,
            &reg.type_name,
            &reg.units,
            frame.flags,
        );
        let fed_flags = self.fed(owner).map(|f| f.flags).unwrap_or_default();
        match reg.kind {
            InterfaceKind::Endpoint => {
                self.endpoints.insert(handle, Default::default());
            }
            InterfaceKind::Publication => {
                let mut info = crate::interfaces::PublicationInfo::default();
                info.only_transmit_on_change = fed_flags.only_transmit_on_change;
                self.publications.insert(handle, info);
            }
            InterfaceKind::Input => {
                let mut info = crate::interfaces::InputInfo::default();
                info.only_update_on_change = fed_flags.only_update_on_change;
                self.inputs.insert(handle, info);
            }
            InterfaceKind::Filter => {
                self.filters
                    .insert(handle, crate::interfaces::FilterInfo::new(reg.cloning));
            }
            InterfaceKind::Translator => {
                self.translators
                    .insert(handle, crate::interfaces::TranslatorInfo::new());
            }
        }

        self.pending_iface_acks.insert(frame.message_id, handle);
        let upward = ControlFrame::new(Action::RegisterInterface)
            .source(host_global, handle)
            .name(key)
            .message_id(frame.message_id)
            .payload(frame.payload);
        self.transmit_parent(upward);
    }

    fn handle_interface_ack(&mut self, frame: ControlFrame) {
        let Some(handle) = self.pending_iface_acks.remove(&frame.message_id) else {
            return;
        };
        let global = frame.dest;
        self.waiters
            .resolve(frame.message_id, Ok(Reply::Interface { handle, global }));
    }

    fn handle_error_reply(&mut self, frame: ControlFrame) {
        if let Some(local) = self.pending_fed_acks.remove(&frame.message_id) {
            self.set_mode(local, FederateMode::Error);
        }
        if let Some(handle) = self.pending_iface_acks.remove(&frame.message_id) {
            // The optimistic local handle is withdrawn; the prior
            // registration elsewhere stays intact.
            self.handles.write().unwrap().close(handle);
            self.endpoints.remove(&handle);
            self.publications.remove(&handle);
            self.inputs.remove(&handle);
            self.filters.remove(&handle);
            self.translators.remove(&handle);
        }
        self.waiters.resolve(
            frame.message_id,
            Err(Error::from_code(frame.counter, frame.info)),
        );
    }

    // ---- linkage ----

    fn handle_add_target(&mut self, frame: ControlFrame) {
        // Default destinations never leave the owning core; everything
        // else resolves at the root.
        let request: Option<crate::frame::TargetRequest> =
            bincode::deserialize(&frame.payload).ok();
        if let Some(request) = request {
            if request.relationship == Relationship::DefaultDestination {
                if let Some(ep) = self.endpoints.get_mut(&request.origin.handle) {
                    ep.default_dest = Some(request.target_name);
                }
                return;
            }
        }
        self.transmit_parent(frame);
    }

    fn handle_target_link(&mut self, frame: ControlFrame) {
        let notice: LinkNotice = match bincode::deserialize(&frame.payload) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!("undecodable link notice: {err}");
                return;
            }
        };
        self.known_interfaces.insert(
            notice.source.key.clone(),
            (notice.source.handle, notice.source.kind),
        );
        self.known_interfaces.insert(
            notice.target.key.clone(),
            (notice.target.handle, notice.target.kind),
        );

        let for_fed = frame.dest.federate;
        let src_local = notice.source.handle.federate == for_fed;
        let dst_local = notice.target.handle.federate == for_fed;

        match notice.relationship {
            Relationship::PublicationToInput => {
                if src_local {
                    let h = notice.source.handle.handle;
                    match notice.source.kind {
                        InterfaceKind::Translator => {
                            if let Some(t) = self.translators.get_mut(&h) {
                                t.add_value_subscriber(notice.target.handle, &notice.target.key);
                            }
                        }
                        _ => {
                            if let Some(p) = self.publications.get_mut(&h) {
                                p.add_subscriber(notice.target.handle, &notice.target.key);
                            }
                        }
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
                if dst_local {
                    let h = notice.target.handle.handle;
                    if let Some(i) = self.inputs.get_mut(&h) {
                        i.add_source(notice.source.handle, &notice.source.key);
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
            }
            Relationship::EndpointToEndpoint => {
                if src_local {
                    let h = notice.source.handle.handle;
                    match notice.source.kind {
                        InterfaceKind::Translator => {
                            if let Some(t) = self.translators.get_mut(&h) {
                                t.add_message_target(notice.target.handle, &notice.target.key);
                            }
                        }
                        _ => {
                            if let Some(e) = self.endpoints.get_mut(&h) {
                                e.add_destination(notice.target.handle, &notice.target.key);
                            }
                        }
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
                if dst_local {
                    let h = notice.target.handle.handle;
                    if let Some(e) = self.endpoints.get_mut(&h) {
                        e.add_source(notice.source.handle, &notice.source.key);
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
            }
            Relationship::SourceFilter | Relationship::DestinationFilter => {
                let dest_side = notice.relationship == Relationship::DestinationFilter;
                if src_local {
                    // We host the filter's operator.
                    let h = notice.source.handle.handle;
                    if let Some(f) = self.filters.get_mut(&h) {
                        let list = if dest_side {
                            &mut f.dest_endpoints
                        } else {
                            &mut f.source_endpoints
                        };
                        if !list.iter().any(|t| t.id == notice.target.handle) {
                            list.push(crate::interfaces::TargetInfo {
                                id: notice.target.handle,
                                key: notice.target.key.clone(),
                            });
                        }
                        let chains = if dest_side {
                            &mut self.dest_chains
                        } else {
                            &mut self.source_chains
                        };
                        let chain = chains.entry(notice.target.key.clone()).or_default();
                        if !chain.contains(&h) {
                            chain.push(h);
                        }
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
                if dst_local {
                    // We own the filtered endpoint.
                    let h = notice.target.handle.handle;
                    if let Some(e) = self.endpoints.get_mut(&h) {
                        let filter_ref = crate::interfaces::FilterRef {
                            id: notice.source.handle,
                            key: notice.source.key.clone(),
                            host: notice.source.handle.federate,
                            cloning: notice.cloning,
                        };
                        let list = if dest_side {
                            &mut e.dest_filters
                        } else {
                            &mut e.source_filters
                        };
                        if !list.iter().any(|f| f.id == notice.source.handle) {
                            list.push(filter_ref);
                        }
                    }
                    self.handles.write().unwrap().mark_used(h);
                }
            }
            Relationship::DeliveryEndpoint => {
                if src_local {
                    let h = notice.source.handle.handle;
                    if let Some(f) = self.filters.get_mut(&h) {
                        f.add_delivery(&notice.target.key);
                    }
                }
            }
            Relationship::DefaultDestination => {}
        }
    }

    fn handle_add_dependency(&mut self, frame: ControlFrame) {
        let notice: DependencyNotice = match bincode::deserialize(&frame.payload) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!("undecodable dependency notice: {err}");
                return;
            }
        };
        let Some(local) = self.fed_by_global(frame.dest.federate) else {
            return;
        };
        if let Some(fed) = self.fed_mut(local) {
            let delay = if notice.dependency {
                notice.delay + fed.coordinator.props().input_delay
            } else {
                notice.delay
            };
            fed.coordinator
                .set_edge(notice.partner, delay, notice.dependency, notice.dependent);
        }
        self.after_time_event(local);
    }

    // ---- lifecycle barriers ----

    fn handle_init_ready(&mut self, frame: ControlFrame) {
        if !frame.source.federate.is_valid() {
            // Explicit release of the delayed-init hold.
            self.delay_init_holds = 0;
            self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
            self.maybe_send_init_ready();
            return;
        }
        let Some(local) = self.fed_by_global(frame.source.federate) else {
            return;
        };
        let mode = match self.fed(local) {
            Some(fed) => fed.mode,
            None => return,
        };
        if mode != FederateMode::Created {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState(format!(
                    "cannot enter initializing from {mode}"
                ))),
            );
            return;
        }
        if let Some(fed) = self.fed_mut(local) {
            fed.init_ready = true;
            fed.pending_init = Some(frame.message_id);
        }
        self.maybe_send_init_ready();
    }

    pub(crate) fn maybe_send_init_ready(&mut self) {
        if self.init_sent || self.base.mode != NodeMode::Operating {
            return;
        }
        if self.delay_init_holds > 0 {
            return;
        }
        let user_feds: Vec<_> = self.federates.iter().filter(|f| !f.synthetic).collect();
        if user_feds.is_empty() || !user_feds.iter().all(|f| f.init_ready) {
            return;
        }
        // Identity must have settled for everything we registered.
        if self.federates.iter().any(|f| !f.global_id.is_valid()) {
            return;
        }
        self.init_sent = true;
        let frame = ControlFrame::new(Action::InitReady).source_federate(self.core_id());
        self.transmit_parent(frame);
    }

    fn handle_init_grant(&mut self) {
        if self.init_granted {
            return;
        }
        self.init_granted = true;
        tracing::info!(core = %self.base.name(), "initialization granted");
        let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();
        for local in locals {
            let mode = self.fed(local).map(|f| f.mode);
            if mode == Some(FederateMode::Created) {
                self.set_mode(local, FederateMode::Initializing);
            }
            if let Some(id) = self.fed_mut(local).and_then(|f| f.pending_init.take()) {
                self.waiters.resolve(id, Ok(Reply::Ack));
            }
        }
    }

    fn handle_exec_request(&mut self, frame: ControlFrame) {
        let Some(local) = self.fed_by_global(frame.source.federate) else {
            return;
        };
        let mode = match self.fed(local) {
            Some(fed) => fed.mode,
            None => return,
        };
        if mode != FederateMode::Initializing {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState(format!(
                    "cannot enter executing from {mode}"
                ))),
            );
            return;
        }
        let iterate = IterationRequest::from_wire(frame.flags);
        if let Some(fed) = self.fed_mut(local) {
            fed.pending_exec = Some(PendingExec {
                message_id: frame.message_id,
                iterate,
            });
        }
        let upward = ControlFrame::new(Action::ExecRequest)
            .source_federate(frame.source.federate)
            .counter(self.exec_round)
            .flag(iterate.wire());
        self.transmit_parent(upward);
    }

    fn handle_exec_grant(&mut self, frame: ControlFrame) {
        let iterating_round = frame.flags & 1 != 0;
        let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();

        if iterating_round {
            self.exec_round = frame.counter.wrapping_add(1);
            for local in locals {
                let Some(fed) = self.fed_mut(local) else { continue };
                let Some(pending) = fed.pending_exec.take() else { continue };
                if pending.iterate == IterationRequest::NoIteration {
                    // Re-arm for the next round automatically.
                    fed.pending_exec = Some(PendingExec {
                        message_id: pending.message_id,
                        iterate: IterationRequest::NoIteration,
                    });
                    let source = fed.global_id;
                    let round = self.exec_round;
                    let upward = ControlFrame::new(Action::ExecRequest)
                        .source_federate(source)
                        .counter(round);
                    self.transmit_parent(upward);
                } else {
                    // Fold freshly published init values into view.
                    self.apply_initial_values(local);
                    self.waiters.resolve(
                        pending.message_id,
                        Ok(Reply::Exec {
                            result: IterationResult::Iterating,
                        }),
                    );
                }
            }
            return;
        }

        self.exec_round = frame.counter;
        tracing::info!(core = %self.base.name(), "executing mode granted");
        for local in locals {
            let mode = self.fed(local).map(|f| f.mode);
            if mode != Some(FederateMode::Initializing) {
                continue;
            }
            self.set_mode(local, FederateMode::Executing);
            self.apply_initial_values(local);
            let synthetic = {
                let fed = self.fed_mut(local).unwrap();
                fed.coordinator.enter_executing(Time::ZERO);
                fed.synthetic
            };
            if synthetic {
                self.fed_mut(local)
                    .unwrap()
                    .coordinator
                    .request(Time::MAXIMUM, IterationRequest::NoIteration);
            }
            if let Some(pending) = self.fed_mut(local).unwrap().pending_exec.take() {
                self.waiters.resolve(
                    pending.message_id,
                    Ok(Reply::Exec {
                        result: IterationResult::NextStep,
                    }),
                );
            }
            self.after_time_event(local);
        }
    }

    /// Fold values published before executing mode into each input.
    fn apply_initial_values(&mut self, local: LocalFederateId) {
        let owned: Vec<_> = {
            let handles = self.handles.read().unwrap();
            handles
                .owned_by(local)
                .filter(|h| h.kind == InterfaceKind::Input)
                .map(|h| h.handle)
                .collect()
        };
        for handle in owned {
            if let Some(input) = self.inputs.get_mut(&handle) {
                input.apply_up_to(Time::ZERO);
            }
        }
    }

    // ---- time protocol ----

    fn handle_request_time(&mut self, frame: ControlFrame) {
        let Some(local) = self.fed_by_global(frame.source.federate) else {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidIdentifier(format!(
                    "unknown federate {}",
                    frame.source.federate
                ))),
            );
            return;
        };
        let (mode, outstanding) = match self.fed(local) {
            Some(fed) => (fed.mode, fed.pending_time.is_some()),
            None => return,
        };
        if mode != FederateMode::Executing {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState(format!(
                    "time can only be requested in the executing mode, not {mode}"
                ))),
            );
            return;
        }
        if outstanding {
            self.waiters.resolve(
                frame.message_id,
                Err(Error::InvalidState(
                    "a time request is already outstanding".into(),
                )),
            );
            return;
        }
        if let Some(fed) = self.fed_mut(local) {
            let deadline = fed
                .coordinator
                .props()
                .grant_timeout
                .map(|timeout| tokio::time::Instant::now() + timeout);
            fed.pending_time = Some(PendingTime {
                message_id: frame.message_id,
                deadline,
            });
            let iterate = IterationRequest::from_wire(frame.counter);
            fed.coordinator.request(frame.time, iterate);
        }
        self.after_time_event(local);
    }

    fn handle_time_update(&mut self, frame: ControlFrame) {
        let Some(local) = self.fed_by_global(frame.dest.federate) else {
            return;
        };
        let update: TimingUpdate = match bincode::deserialize(&frame.payload) {
            Ok(update) => update,
            Err(err) => {
                tracing::warn!("undecodable timing update: {err}");
                return;
            }
        };
        let changed = self
            .fed_mut(local)
            .map(|fed| fed.coordinator.partner_update(frame.source.federate, update))
            .unwrap_or(false);
        if changed {
            self.after_time_event(local);
        }
    }

    /// Re-evaluate a federate's pending request after any time-relevant
    /// event, then push advertisement changes to its dependents.
    pub(crate) fn after_time_event(&mut self, local: LocalFederateId) {
        loop {
            let ev = self.earliest_event(local);
            let outcome = {
                let Some(fed) = self.fed_mut(local) else { return };
                let updated = fed.updated_at_granted;
                fed.coordinator.evaluate(ev, updated)
            };
            match outcome {
                GrantOutcome::Granted {
                    time,
                    result,
                    iteration,
                } => {
                    self.apply_grant(local, time, result, iteration);
                }
                GrantOutcome::Waiting => break,
            }
        }
        self.push_adverts(local);
    }

    fn apply_grant(
        &mut self,
        local: LocalFederateId,
        time: Time,
        result: IterationResult,
        iteration: u32,
    ) {
        tracing::debug!(
            core = %self.base.name(),
            federate = %local,
            %time,
            ?result,
            "time granted"
        );
        let owned: Vec<(InterfaceHandle, InterfaceKind)> = {
            let handles = self.handles.read().unwrap();
            handles
                .owned_by(local)
                .map(|h| (h.handle, h.kind))
                .collect()
        };
        for (handle, kind) in owned {
            match kind {
                InterfaceKind::Endpoint => {
                    if let Some(ep) = self.endpoints.get_mut(&handle) {
                        ep.update_time_inclusive(time);
                    }
                }
                InterfaceKind::Input => {
                    if let Some(input) = self.inputs.get_mut(&handle) {
                        if result != IterationResult::Iterating {
                            input.clear_updated();
                        }
                        input.apply_up_to(time);
                    }
                }
                _ => {}
            }
        }

        let (synthetic, pending) = {
            let fed = self.fed_mut(local).unwrap();
            fed.updated_at_granted = false;
            (fed.synthetic, fed.pending_time.take())
        };
        if let Some(pending) = pending {
            self.waiters.resolve(
                pending.message_id,
                Ok(Reply::TimeGrant {
                    time,
                    result,
                    iteration,
                }),
            );
        }
        if synthetic {
            self.process_operator_work(local, time);
            if let Some(fed) = self.fed_mut(local) {
                fed.coordinator
                    .request(Time::MAXIMUM, IterationRequest::NoIteration);
            }
        }
    }

    pub(crate) fn push_adverts(&mut self, local: LocalFederateId) {
        let ev = self.earliest_event(local);
        let (source, adverts) = {
            let Some(fed) = self.fed_mut(local) else { return };
            (fed.global_id, fed.coordinator.pending_adverts(ev))
        };
        if !source.is_valid() {
            return;
        }
        for (partner, update) in adverts {
            let frame = ControlFrame::new(Action::TimeUpdate)
                .source_federate(source)
                .dest_federate(partner)
                .time(update.te)
                .payload(bincode::serialize(&update).expect("timing update serializes"));
            self.route_frame(frame);
        }
    }

    /// Earliest pending local event after the granted time: queued
    /// messages, pending values, or operator work for the synthetic
    /// federate.
    pub(crate) fn earliest_event(&self, local: LocalFederateId) -> Time {
        let Some(fed) = self.fed(local) else {
            return Time::MAXIMUM;
        };
        if fed.synthetic {
            return self
                .filter_work
                .iter()
                .map(|w| w.time())
                .min()
                .unwrap_or(Time::MAXIMUM);
        }
        let granted = fed.coordinator.granted();
        let handles = self.handles.read().unwrap();
        let mut earliest = Time::MAXIMUM;
        for info in handles.owned_by(local) {
            let t = match info.kind {
                InterfaceKind::Endpoint => self
                    .endpoints
                    .get(&info.handle)
                    .map(|e| e.next_event_time(granted))
                    .unwrap_or(Time::MAXIMUM),
                InterfaceKind::Input => self
                    .inputs
                    .get(&info.handle)
                    .map(|i| i.next_event_time(granted))
                    .unwrap_or(Time::MAXIMUM),
                _ => Time::MAXIMUM,
            };
            earliest = earliest.min(t);
        }
        earliest
    }

    // ---- data plane ----

    fn handle_publish(&mut self, frame: ControlFrame) {
        let Some(local) = self.fed_by_global(frame.source.federate) else {
            return;
        };
        let Some(fed) = self.fed(local) else { return };
        if !matches!(
            fed.mode,
            FederateMode::Executing | FederateMode::Initializing
        ) {
            tracing::warn!(federate = %fed.name, mode = %fed.mode, "publish ignored");
            return;
        }
        let time = if fed.mode == FederateMode::Executing {
            fed.coordinator.granted() + fed.coordinator.props().output_delay
        } else {
            Time::ZERO
        };
        let handle = frame.source.handle;
        let subscribers: Vec<_> = match self.publications.get_mut(&handle) {
            Some(publication) => {
                if !publication.publish(&frame.payload) {
                    return;
                }
                publication
                    .subscribers()
                    .iter()
                    .map(|t| t.id)
                    .collect()
            }
            None => {
                tracing::warn!(handle = %handle, "publish on an unknown publication");
                return;
            }
        };
        for dest in subscribers {
            let value = ControlFrame::new(Action::SetValue)
                .source(frame.source.federate, handle)
                .dest(dest)
                .time(time)
                .payload(frame.payload.clone());
            self.route_frame(value);
        }
    }

    fn handle_set_value(&mut self, frame: ControlFrame) {
        let dest = frame.dest;
        let Some(local) = self.fed_by_global(dest.federate) else {
            let rid = self.routing.get(dest.federate);
            self.connector.transmit(rid, frame);
            return;
        };
        let kind = self
            .handles
            .read()
            .unwrap()
            .get(dest.handle)
            .map(|h| h.kind);
        if frame.has_flag(fflags::INTERNAL) {
            // Default-value installation from the owning federate.
            if let Some(input) = self.inputs.get_mut(&dest.handle) {
                input.set_default(frame.payload);
            }
            return;
        }
        match kind {
            Some(InterfaceKind::Input) => {
                let (granted, input_delay) = {
                    let fed = self.fed(local).unwrap();
                    (
                        fed.coordinator.granted(),
                        fed.coordinator.props().input_delay,
                    )
                };
                let effective = frame.time + input_delay;
                if let Some(input) = self.inputs.get_mut(&dest.handle) {
                    input.store(frame.source, effective, frame.payload);
                }
                if effective == granted {
                    if let Some(fed) = self.fed_mut(local) {
                        fed.updated_at_granted = true;
                    }
                }
                self.after_time_event(local);
            }
            Some(InterfaceKind::Translator) => {
                self.filter_work.push(FilterWork::TranslatorValue {
                    time: frame.time,
                    handle: dest.handle,
                    value: frame.payload,
                });
                if let Some(ff) = self.filter_fed {
                    self.after_time_event(ff);
                }
            }
            _ => tracing::warn!(dest = %dest, "value frame for a non-input handle"),
        }
    }

    fn handle_send(&mut self, frame: ControlFrame) {
        let Some(local) = self.fed_by_global(frame.source.federate) else {
            return;
        };
        let Some(fed) = self.fed(local) else { return };
        if fed.mode != FederateMode::Executing {
            tracing::warn!(federate = %fed.name, mode = %fed.mode, "send ignored");
            return;
        }
        let stamp = (fed.coordinator.granted() + fed.coordinator.props().output_delay)
            .max(frame.time);
        let handle = frame.source.handle;
        let (source_key, explicit_dest) = {
            let handles = self.handles.read().unwrap();
            let Some(info) = handles.get(handle) else {
                tracing::warn!(handle = %handle, "send on an unknown endpoint");
                return;
            };
            (info.key.clone(), frame.name.clone())
        };

        // Resolve the set of destinations: explicit name, configured
        // targets, or the default destination.
        let mut dests: Vec<(String, GlobalHandle)> = Vec::new();
        if !explicit_dest.is_empty() {
            let known = self
                .known_interfaces
                .get(&explicit_dest)
                .map(|(h, _)| *h)
                .unwrap_or(GlobalHandle::INVALID);
            dests.push((explicit_dest, known));
        } else if let Some(ep) = self.endpoints.get(&handle) {
            for target in ep.destinations() {
                dests.push((target.key.clone(), target.id));
            }
            if dests.is_empty() {
                if let Some(default) = &ep.default_dest {
                    let known = self
                        .known_interfaces
                        .get(default)
                        .map(|(h, _)| *h)
                        .unwrap_or(GlobalHandle::INVALID);
                    dests.push((default.clone(), known));
                }
            }
        }
        if dests.is_empty() {
            tracing::warn!(endpoint = %source_key, "send with no destination");
            return;
        }

        for (dest_key, dest_handle) in dests {
            let message = Message {
                source: source_key.clone(),
                original_source: source_key.clone(),
                dest: dest_key.clone(),
                original_dest: dest_key.clone(),
                time: stamp,
                message_id: self.next_message_id(),
                flags: 0,
                payload: frame.payload.clone(),
            };
            self.forward_from_endpoint(handle, message, dest_handle);
        }
    }

    /// Route a freshly-sent message, diverting it through the source
    /// filter chain's host when one is bound.
    pub(crate) fn forward_from_endpoint(
        &mut self,
        source_handle: InterfaceHandle,
        message: Message,
        dest_handle: GlobalHandle,
    ) {
        let filter_host = match self.endpoints.get(&source_handle) {
            Some(ep) if ep.has_source_filters() => Some(ep.source_filters[0].host),
            _ => None,
        };
        if let Some(host) = filter_host {
            let frame = ControlFrame::new(Action::Message)
                .dest_federate(host)
                .name(message.source.clone())
                .time(message.time)
                .payload(message.to_bytes());
            self.route_frame(frame);
        } else {
            self.dispatch_prepared_message(message, dest_handle, fflags::FILTERED_SOURCE);
        }
    }

    /// Build and route a message frame whose filters are resolved.
    pub(crate) fn dispatch_prepared_message(
        &mut self,
        message: Message,
        dest_handle: GlobalHandle,
        flags: u16,
    ) {
        let mut frame = ControlFrame::new(Action::Message)
            .time(message.time)
            .name(message.dest.clone())
            .payload(message.to_bytes());
        frame.flags |= flags;
        frame.dest = dest_handle;
        self.dispatch_message(frame);
    }

    /// Route or deliver a message frame based on its destination.
    pub(crate) fn dispatch_message(&mut self, frame: ControlFrame) {
        let dest = frame.dest;
        if dest.federate.is_valid() {
            if let Some(local) = self.fed_by_global(dest.federate) {
                if dest.handle.is_valid() {
                    self.deliver_message(local, frame);
                } else {
                    // Addressed to our synthetic federate for filtering.
                    self.enqueue_chain_work(frame);
                }
                return;
            }
            let rid = self.routing.get(dest.federate);
            self.connector.transmit(rid, frame);
            return;
        }

        // Name-only destination: resolve locally, through the cache, or
        // upward.
        let key = frame.name.clone();
        let found = self
            .handles
            .read()
            .unwrap()
            .find(InterfaceKind::Endpoint, &key)
            .map(|h| h.global_handle())
            .or_else(|| {
                self.handles
                    .read()
                    .unwrap()
                    .find(InterfaceKind::Translator, &key)
                    .map(|h| h.global_handle())
            });
        if let Some(handle) = found {
            let mut frame = frame;
            frame.dest = handle;
            if let Some(local) = self.fed_by_global(handle.federate) {
                self.deliver_message(local, frame);
            } else {
                self.route_frame(frame);
            }
            return;
        }
        if let Some((handle, _)) = self.known_interfaces.get(&key) {
            let mut frame = frame;
            frame.dest = *handle;
            self.route_frame(frame);
            return;
        }
        self.transmit_parent(frame);
    }

    fn deliver_message(&mut self, local: LocalFederateId, frame: ControlFrame) {
        let handle = frame.dest.handle;
        let kind = self
            .handles
            .read()
            .unwrap()
            .get(handle)
            .map(|h| h.kind);
        let message = match Message::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("undecodable message payload: {err}");
                return;
            }
        };
        match kind {
            Some(InterfaceKind::Endpoint) => {
                let needs_dest_filtering = self
                    .endpoints
                    .get(&handle)
                    .map(|e| e.has_dest_filters())
                    .unwrap_or(false)
                    && !frame.has_flag(fflags::FILTERED_DEST)
                    && !frame.has_flag(fflags::CLONE);
                if needs_dest_filtering {
                    let (host, key) = {
                        let ep = self.endpoints.get(&handle).unwrap();
                        let handles = self.handles.read().unwrap();
                        (
                            ep.dest_filters[0].host,
                            handles.get(handle).map(|h| h.key.clone()).unwrap_or_default(),
                        )
                    };
                    let forward = ControlFrame::new(Action::Message)
                        .dest_federate(host)
                        .name(key)
                        .time(message.time)
                        .flag(fflags::DEST_PROCESS)
                        .payload(frame.payload);
                    self.route_frame(forward);
                    return;
                }
                self.final_delivery(local, handle, message);
            }
            Some(InterfaceKind::Translator) => {
                self.filter_work.push(FilterWork::TranslatorMessage {
                    time: message.time,
                    handle,
                    message: Box::new(message),
                });
                if let Some(ff) = self.filter_fed {
                    self.after_time_event(ff);
                }
            }
            _ => {
                tracing::warn!(handle = %handle, "message for a closed or non-endpoint handle");
            }
        }
    }

    fn final_delivery(&mut self, local: LocalFederateId, handle: InterfaceHandle, mut message: Message) {
        let (granted, input_delay, mode, ignore_mismatch, name) = {
            let Some(fed) = self.fed(local) else { return };
            (
                fed.coordinator.granted(),
                fed.coordinator.props().input_delay,
                fed.mode,
                fed.flags.ignore_time_mismatch_warnings,
                fed.name.clone(),
            )
        };
        if matches!(mode, FederateMode::Finalize | FederateMode::Error) {
            return;
        }
        let mut effective = message.time + input_delay;
        if effective < granted && granted > Time::MIN_VALUE {
            if !ignore_mismatch {
                tracing::warn!(
                    federate = %name,
                    message_time = %effective,
                    %granted,
                    "message arrived behind the granted time; delivering at the granted time"
                );
            }
            effective = granted;
        }
        message.time = effective;
        if effective == granted {
            if let Some(fed) = self.fed_mut(local) {
                fed.updated_at_granted = true;
            }
        }
        if let Some(ep) = self.endpoints.get_mut(&handle) {
            ep.add_message(message);
        }
        self.handles.write().unwrap().mark_used(handle);
        self.after_time_event(local);
    }

    // ---- queries ----

    fn handle_query(&mut self, frame: ControlFrame) {
        let target = frame.name.clone();
        let is_self = target == self.base.name() || target == "core";
        let local_fed = self.fed_names.get(&target).copied();

        let answer = if is_self {
            Some(self.core_query(&frame.info))
        } else {
            local_fed.map(|local| self.federate_query(local, &frame.info))
        };

        match answer {
            Some(json) => {
                if !self.waiters.resolve(frame.message_id, Ok(Reply::Json(json.clone()))) {
                    let mut reply = ControlFrame::new(Action::QueryReply)
                        .message_id(frame.message_id)
                        .payload(json.into_bytes());
                    reply.flags = frame.flags;
                    self.transmit_parent(reply);
                }
            }
            None => {
                let deadline =
                    tokio::time::Instant::now() + self.base.config.query_timeout;
                self.query_deadlines.push((frame.message_id, deadline));
                self.transmit_parent(frame);
            }
        }
    }

    fn handle_query_reply(&mut self, frame: ControlFrame) {
        self.query_deadlines.retain(|(id, _)| *id != frame.message_id);
        let json = String::from_utf8_lossy(&frame.payload).into_owned();
        self.waiters.resolve(frame.message_id, Ok(Reply::Json(json)));
    }

    // ---- errors & teardown ----

    fn handle_local_error(&mut self, frame: ControlFrame) {
        let source = frame.source.federate;
        if let Some(local) = self.fed_by_global(source) {
            // One of ours: enter the error state and tell the federation.
            // Re-broadcasts of an already-failed federate stop here.
            if self.fed(local).map(|f| f.mode) == Some(FederateMode::Error) {
                return;
            }
            let code = frame.counter as i32;
            let message = frame.info.clone();
            self.fail_federate(local, code, message);
            self.transmit_parent(frame);
        } else {
            // A remote federate failed; its edges stop constraining us.
            let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();
            for local in locals {
                let dropped = self
                    .fed_mut(local)
                    .map(|fed| fed.coordinator.partner_disconnected(source))
                    .unwrap_or(false);
                if dropped {
                    self.after_time_event(local);
                }
            }
        }
    }

    pub(crate) fn fail_federate(&mut self, local: LocalFederateId, code: i32, message: String) {
        self.set_mode(local, FederateMode::Error);
        let pending = {
            let Some(fed) = self.fed_mut(local) else { return };
            fed.error = Some((code, message.clone()));
            fed.coordinator.finalize();
            (
                fed.pending_time.take(),
                fed.pending_exec.take(),
                fed.pending_init.take(),
            )
        };
        let err = || Error::Local {
            code,
            message: message.clone(),
        };
        if let Some(p) = pending.0 {
            self.waiters.resolve(p.message_id, Err(err()));
        }
        if let Some(p) = pending.1 {
            self.waiters.resolve(p.message_id, Err(err()));
        }
        if let Some(id) = pending.2 {
            self.waiters.resolve(id, Err(err()));
        }
        self.push_adverts(local);
        self.maybe_core_done();
    }

    fn handle_global_error(&mut self, frame: ControlFrame) {
        if self.fed_by_global(frame.source.federate).is_some()
            && self.global_error.is_none()
            && !frame.has_flag(fflags::GLOBAL_SCOPE)
        {
            // Originated here: let the root broadcast it back down.
            self.transmit_parent(frame);
            return;
        }
        let code = frame.counter as i32;
        let message = frame.info.clone();
        if self.global_error.is_some() {
            return;
        }
        self.global_error = Some((code, message.clone()));
        tracing::error!(core = %self.base.name(), code, message, "federation aborted");
        let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();
        for local in locals {
            self.fail_federate(local, code, message.clone());
        }
        self.waiters.drain_with(|| Error::Global {
            code,
            message: message.clone(),
        });
    }

    fn handle_disconnect(&mut self, frame: ControlFrame) {
        let source = frame.source.federate;
        if !source.is_valid() {
            // Link-initiated core shutdown.
            self.shutdown(frame.message_id);
            return;
        }
        if let Some(local) = self.fed_by_global(source) {
            if frame.source.handle.is_valid() {
                // Closing a single interface: tombstone it; no further
                // traffic is delivered to or from the handle.
                self.close_interface(frame.source.handle);
                self.waiters.resolve(frame.message_id, Ok(Reply::Ack));
                return;
            }
            self.finalize_federate(local, frame.message_id);
            return;
        }
        // A remote federate left; drop its constraint.
        let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();
        for local in locals {
            let dropped = self
                .fed_mut(local)
                .map(|fed| fed.coordinator.partner_disconnected(source))
                .unwrap_or(false);
            if dropped {
                self.after_time_event(local);
            }
        }
    }

    fn close_interface(&mut self, handle: InterfaceHandle) {
        if !self.handles.write().unwrap().close(handle) {
            return;
        }
        self.endpoints.remove(&handle);
        self.publications.remove(&handle);
        self.inputs.remove(&handle);
        self.filters.remove(&handle);
        self.translators.remove(&handle);
    }

    pub(crate) fn finalize_federate(&mut self, local: LocalFederateId, message_id: u32) {
        let (mode, pending_time) = {
            let Some(fed) = self.fed_mut(local) else { return };
            let pending = fed.pending_time.take();
            (fed.mode, pending)
        };
        if let Some(p) = pending_time {
            self.waiters.resolve(
                p.message_id,
                Ok(Reply::TimeGrant {
                    time: Time::MAXIMUM,
                    result: IterationResult::Halted,
                    iteration: 0,
                }),
            );
        }
        if !matches!(mode, FederateMode::Error | FederateMode::Finalize) {
            self.set_mode(local, FederateMode::Finalize);
            if let Some(fed) = self.fed_mut(local) {
                fed.coordinator.finalize();
            }
            let global = self.fed(local).map(|f| f.global_id).unwrap_or_default();
            self.push_adverts(local);
            if global.is_valid() {
                self.transmit_parent(
                    ControlFrame::new(Action::Disconnect).source_federate(global),
                );
            }
        }
        self.waiters.resolve(message_id, Ok(Reply::Ack));
        self.maybe_core_done();
    }

    /// Once every user federate is terminal, retire the synthetic federate
    /// and tell the parent this core is leaving.
    fn maybe_core_done(&mut self) {
        if self.core_disconnect_sent || self.base.is_terminating() {
            return;
        }
        let user_feds_done = self
            .federates
            .iter()
            .filter(|f| !f.synthetic)
            .all(|f| matches!(f.mode, FederateMode::Finalize | FederateMode::Error));
        if self.federates.iter().any(|f| !f.synthetic) && user_feds_done {
            if let Some(ff) = self.filter_fed {
                self.set_mode(ff, FederateMode::Finalize);
                if let Some(fed) = self.fed_mut(ff) {
                    fed.coordinator.finalize();
                }
                self.push_adverts(ff);
            }
            self.core_disconnect_sent = true;
            self.transmit_parent(
                ControlFrame::new(Action::Disconnect).source_federate(self.core_id()),
            );
        }
    }

    fn shutdown(&mut self, _message_id: u32) {
        if !self.base.begin_terminate() {
            // Already going down; the disconnect watch covers the caller.
            return;
        }
        tracing::info!(core = %self.base.name(), "disconnecting");
        let locals: Vec<_> = self.federates.iter().map(|f| f.local_id).collect();
        for local in locals {
            let pending = {
                let Some(fed) = self.fed_mut(local) else { continue };
                fed.coordinator.finalize();
                (
                    fed.pending_time.take(),
                    fed.pending_exec.take(),
                    fed.pending_init.take(),
                )
            };
            if fed_mode_is_active(self.fed(local)) {
                self.set_mode(local, FederateMode::Finalize);
            }
            let connection_err = || Error::Connection("core disconnected".into());
            if let Some(p) = pending.0 {
                self.waiters.resolve(p.message_id, Err(connection_err()));
            }
            if let Some(p) = pending.1 {
                self.waiters.resolve(p.message_id, Err(connection_err()));
            }
            if let Some(id) = pending.2 {
                self.waiters.resolve(id, Err(connection_err()));
            }
        }
        if !self.core_disconnect_sent {
            self.core_disconnect_sent = true;
            self.transmit_parent(
                ControlFrame::new(Action::Disconnect).source_federate(self.core_id()),
            );
        }
        self.waiters
            .drain_with(|| Error::Connection("core disconnected".into()));
    }

    fn handle_disconnect_ack(&mut self) {
        self.base.begin_terminate();
        self.waiters
            .drain_with(|| Error::Connection("core disconnected".into()));
        self.connector.broker_disconnect();
        self.base.signal_disconnected();
    }

    fn handle_tick(&mut self) {
        let now = tokio::time::Instant::now();

        // Expired time requests put the federate into the error state.
        let expired: Vec<(LocalFederateId, u64)> = self
            .federates
            .iter()
            .filter_map(|fed| {
                fed.pending_time
                    .as_ref()
                    .and_then(|p| p.deadline)
                    .filter(|deadline| *deadline <= now)
                    .map(|_| {
                        let ms = fed
                            .coordinator
                            .props()
                            .grant_timeout
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        (fed.local_id, ms)
                    })
            })
            .collect();
        for (local, ms) in expired {
            let (pending, global) = {
                let Some(fed) = self.fed_mut(local) else { continue };
                (fed.pending_time.take(), fed.global_id)
            };
            tracing::error!(federate = %local, "time request deadline expired");
            if let Some(p) = pending {
                self.waiters
                    .resolve(p.message_id, Err(Error::TimeCoordinationTimeout(ms)));
            }
            self.fail_federate(local, -1, "time grant deadline expired".into());
            if global.is_valid() {
                self.transmit_parent(
                    ControlFrame::new(Action::LocalError)
                        .source_federate(global)
                        .info("time grant deadline expired"),
                );
            }
        }

        // Expired queries wake their waiters with an error.
        let expired_queries: Vec<u32> = self
            .query_deadlines
            .iter()
            .filter(|(_, deadline)| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        self.query_deadlines.retain(|(_, deadline)| *deadline > now);
        for id in expired_queries {
            self.waiters.resolve(
                id,
                Err(Error::Other(anyhow::anyhow!("query timed out"))),
            );
        }
    }

    // ---- local reads ----

    pub(crate) fn handle_read(&mut self, request: ReadRequest) {
        let ReadRequest { kind, reply } = request;
        let result = match kind {
            ReadKind::Value { handle, .. } => Ok(Reply::Value(
                self.inputs.get(&handle).and_then(|i| i.value()),
            )),
            ReadKind::NextMessage { federate, handle } => {
                let granted = self
                    .fed(federate)
                    .map(|f| f.coordinator.granted())
                    .unwrap_or(Time::MAXIMUM);
                Ok(Reply::Message(
                    self.endpoints
                        .get_mut(&handle)
                        .and_then(|e| e.get_message(granted))
                        .map(Box::new),
                ))
            }
            ReadKind::NextMessageAny { federate } => {
                let granted = self
                    .fed(federate)
                    .map(|f| f.coordinator.granted())
                    .unwrap_or(Time::MAXIMUM);
                let owned: Vec<InterfaceHandle> = {
                    let handles = self.handles.read().unwrap();
                    handles
                        .owned_by(federate)
                        .filter(|h| h.kind == InterfaceKind::Endpoint)
                        .map(|h| h.handle)
                        .collect()
                };
                let best = owned
                    .into_iter()
                    .filter_map(|h| {
                        let ep = self.endpoints.get(&h)?;
                        (ep.available_messages() > 0)
                            .then(|| (ep.first_message_time(), h))
                    })
                    .min();
                Ok(Reply::MessageAny(best.and_then(|(_, h)| {
                    self.endpoints
                        .get_mut(&h)
                        .and_then(|e| e.get_message(granted))
                        .map(|m| (h, Box::new(m)))
                })))
            }
            ReadKind::PendingCount { handle, .. } => Ok(Reply::Count(
                self.endpoints
                    .get(&handle)
                    .map(|e| e.available_messages() as u64)
                    .unwrap_or(0),
            )),
            ReadKind::PendingCountAny { federate } => {
                let handles = self.handles.read().unwrap();
                let count: u64 = handles
                    .owned_by(federate)
                    .filter(|h| h.kind == InterfaceKind::Endpoint)
                    .filter_map(|h| self.endpoints.get(&h.handle))
                    .map(|e| e.available_messages() as u64)
                    .sum();
                Ok(Reply::Count(count))
            }
            ReadKind::CurrentTime { federate } => Ok(Reply::Time(
                self.fed(federate)
                    .map(|f| f.coordinator.granted())
                    .unwrap_or(Time::MIN_VALUE),
            )),
            ReadKind::Mode { federate } => Ok(Reply::Mode(
                self.fed(federate)
                    .map(|f| f.mode)
                    .unwrap_or(FederateMode::Created),
            )),
            ReadKind::InputUpdated { handle, .. } => Ok(Reply::Flag(
                self.inputs.get(&handle).map(|i| i.is_updated()).unwrap_or(false),
            )),
        };
        let _ = reply.send(result);
    }
}

fn fed_mode_is_active(fed: Option<&FederateState>) -> bool {
    fed.map(|f| {
        !matches!(f.mode, FederateMode::Finalize | FederateMode::Error)
    })
    .unwrap_or(false)
}
