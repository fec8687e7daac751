//! The synthetic operator federate: lazy scheduling of filter chains and
//! translators at message-effective times.

use std::sync::Arc;

use conflux_core::flags::frame as fflags;
use conflux_core::flags::FederateFlags;
use conflux_core::{GlobalHandle, InterfaceHandle, LocalFederateId, Time};

use crate::coordination::TimeProperties;
use crate::federate::{FederateMode, FederateState};
use crate::frame::{Action, ControlFrame, FederateReg};
use crate::interfaces::{FilterOperator, FilterResult, TranslatorOperator};
use crate::message::Message;

use super::{Core, FilterWork, OPERATOR_FED_SUFFIX};

impl Core {
    /// The synthetic federate's local id once its identity has settled.
    /// Creates and registers it on first use, returning `None` while the
    /// registration is in flight.
    pub(crate) fn operator_fed_ready(&mut self) -> Option<LocalFederateId> {
        if let Some(local) = self.filter_fed {
            return self
                .fed(local)
                .is_some_and(|f| f.global_id.is_valid())
                .then_some(local);
        }

        let name = format!("{}{}", self.base.name(), OPERATOR_FED_SUFFIX);
        let local = LocalFederateId::new(self.federates.len() as u32 + 1);
        let fed = FederateState::new(
            &name,
            local,
            TimeProperties::default(),
            FederateFlags::default(),
            true,
        );
        self.federates.push(fed);
        self.fed_names.insert(name.clone(), local);
        self.modes
            .write()
            .unwrap()
            .insert(local, FederateMode::Created);
        self.filter_fed = Some(local);

        let (message_id, _discarded) = self.waiters.register();
        self.waiters.forget(message_id);
        self.pending_fed_acks.insert(message_id, local);
        let reg = FederateReg {
            props: TimeProperties::default(),
            flags: FederateFlags::default(),
            synthetic: true,
        };
        let frame = ControlFrame::new(Action::RegisterFederate)
            .name(name)
            .message_id(message_id)
            .flag(fflags::SYNTHETIC)
            .payload(bincode::serialize(&reg).expect("federate registration serializes"));
        self.transmit_parent(frame);
        None
    }

    /// Enqueue an inbound message for chain processing on the synthetic
    /// federate.
    pub(crate) fn enqueue_chain_work(&mut self, frame: ControlFrame) {
        let message = match Message::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("undecodable filter-bound message: {err}");
                return;
            }
        };
        let dest_stage = frame.has_flag(fflags::DEST_PROCESS);
        self.filter_work.push(FilterWork::Chain {
            time: message.time,
            message: Box::new(message),
            endpoint_key: frame.name,
            dest_stage,
        });
        if let Some(ff) = self.filter_fed {
            self.after_time_event(ff);
        }
    }

    /// Run every work item whose effective time has been granted.
    pub(crate) fn process_operator_work(&mut self, local: LocalFederateId, granted: Time) {
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.filter_work.len() {
            if self.filter_work[index].time() <= granted {
                ready.push(self.filter_work.remove(index));
            } else {
                index += 1;
            }
        }
        for work in ready {
            match work {
                FilterWork::Chain {
                    message,
                    endpoint_key,
                    dest_stage,
                    ..
                } => self.run_chain(*message, endpoint_key, dest_stage),
                FilterWork::TranslatorValue { time, handle, value } => {
                    self.run_translator_value(local, handle, time, value)
                }
                FilterWork::TranslatorMessage { handle, message, .. } => {
                    self.run_translator_message(local, handle, *message)
                }
            }
        }
    }

    fn run_chain(&mut self, mut message: Message, endpoint_key: String, dest_stage: bool) {
        let chain: Vec<InterfaceHandle> = if dest_stage {
            self.dest_chains.get(&endpoint_key).cloned().unwrap_or_default()
        } else {
            self.source_chains.get(&endpoint_key).cloned().unwrap_or_default()
        };

        let mut copies: Vec<Message> = Vec::new();
        let mut dropped = false;
        for handle in chain {
            // Pull what the step needs up front; the operator runs without
            // any core borrow held.
            let step: Option<(bool, Option<Arc<dyn FilterOperator>>, Vec<String>)> = self
                .filters
                .get(&handle)
                .map(|f| (f.cloning, f.operator.clone(), f.delivery.clone()));
            let Some((cloning, operator, delivery)) = step else {
                continue;
            };
            if cloning {
                let deliver = operator
                    .as_ref()
                    .map(|op| op.clone_condition(&message))
                    .unwrap_or(true);
                if deliver {
                    for dest in delivery {
                        let mut copy = message.clone();
                        copy.dest = dest;
                        copy.flags |= fflags::CLONE;
                        copies.push(copy);
                    }
                }
                continue;
            }
            let Some(operator) = operator else { continue };
            let original_source = message.original_source.clone();
            let original_dest = message.original_dest.clone();
            let floor = message.time;
            match operator.process(message.clone()) {
                FilterResult::Pass(mut rewritten) => {
                    // Originals are kernel-owned and time never moves
                    // backwards through a filter.
                    rewritten.original_source = original_source;
                    rewritten.original_dest = original_dest;
                    rewritten.time = rewritten.time.max(floor);
                    message = rewritten;
                }
                FilterResult::Drop => {
                    dropped = true;
                    break;
                }
            }
        }

        for copy in copies {
            let dest_handle = self.lookup_known(&copy.dest);
            self.dispatch_prepared_message(
                copy,
                dest_handle,
                fflags::FILTERED_SOURCE | fflags::CLONE,
            );
        }
        if dropped {
            return;
        }

        let mut flags = fflags::FILTERED_SOURCE;
        if dest_stage && message.dest == endpoint_key {
            flags |= fflags::FILTERED_DEST;
        }
        let dest_handle = self.lookup_known(&message.dest);
        self.dispatch_prepared_message(message, dest_handle, flags);
    }

    fn run_translator_value(
        &mut self,
        local: LocalFederateId,
        handle: InterfaceHandle,
        time: Time,
        value: Vec<u8>,
    ) {
        let step = self.translators.get(&handle).map(|t| {
            (
                t.operator.clone(),
                t.message_targets
                    .iter()
                    .map(|target| (target.key.clone(), target.id))
                    .collect::<Vec<_>>(),
            )
        });
        let Some((operator, targets)) = step else { return };
        let Some(operator) = operator else {
            tracing::warn!(handle = %handle, "translator has no operator; value dropped");
            return;
        };
        let key = self
            .handles
            .read()
            .unwrap()
            .get(handle)
            .map(|h| h.key.clone())
            .unwrap_or_default();
        let payload = operator.value_to_message(&value);
        let granted = self
            .fed(local)
            .map(|f| f.coordinator.granted())
            .unwrap_or(time);
        for (dest_key, dest_handle) in targets {
            let message = Message {
                source: key.clone(),
                original_source: key.clone(),
                dest: dest_key.clone(),
                original_dest: dest_key,
                time: time.max(granted),
                message_id: self.next_message_id(),
                flags: 0,
                payload: payload.clone(),
            };
            self.dispatch_prepared_message(message, dest_handle, fflags::FILTERED_SOURCE);
        }
    }

    fn run_translator_message(
        &mut self,
        local: LocalFederateId,
        handle: InterfaceHandle,
        message: Message,
    ) {
        let step = self.translators.get(&handle).map(|t| {
            (
                t.operator.clone(),
                t.value_subscribers
                    .iter()
                    .map(|target| target.id)
                    .collect::<Vec<_>>(),
            )
        });
        let Some((operator, subscribers)) = step else { return };
        let Some(operator) = operator else {
            tracing::warn!(handle = %handle, "translator has no operator; message dropped");
            return;
        };
        let value = operator.message_to_value(&message.payload);
        let source_fed = self
            .fed(local)
            .map(|f| f.global_id)
            .unwrap_or_default();
        for dest in subscribers {
            let frame = ControlFrame::new(Action::SetValue)
                .source(source_fed, handle)
                .dest(dest)
                .time(message.time)
                .payload(value.clone());
            self.route_frame(frame);
        }
    }

    fn lookup_known(&self, key: &str) -> GlobalHandle {
        if let Some(info) = self
            .handles
            .read()
            .unwrap()
            .find(crate::frame::InterfaceKind::Endpoint, key)
        {
            return info.global_handle();
        }
        self.known_interfaces
            .get(key)
            .map(|(handle, _)| *handle)
            .unwrap_or(GlobalHandle::INVALID)
    }

    pub(crate) fn set_filter_operator(
        &mut self,
        handle: InterfaceHandle,
        operator: Option<Arc<dyn FilterOperator>>,
    ) {
        let shift = operator
            .as_ref()
            .map(|op| op.time_shift())
            .unwrap_or(Time::ZERO);
        let report = match self.filters.get_mut(&handle) {
            Some(filter) => {
                filter.operator = operator;
                if filter.reported_shift != shift {
                    filter.reported_shift = shift;
                    true
                } else {
                    false
                }
            }
            None => {
                tracing::warn!(handle = %handle, "operator installed on an unknown filter");
                return;
            }
        };
        if report {
            let source = self
                .handles
                .read()
                .unwrap()
                .get(handle)
                .map(|h| h.global_handle())
                .unwrap_or(GlobalHandle::INVALID);
            if source.is_valid() {
                self.transmit_parent(
                    ControlFrame::new(Action::FilterTiming)
                        .source(source.federate, source.handle)
                        .time(shift),
                );
            }
        }
    }

    pub(crate) fn set_translator_operator(
        &mut self,
        handle: InterfaceHandle,
        operator: Option<Arc<dyn TranslatorOperator>>,
    ) {
        match self.translators.get_mut(&handle) {
            Some(translator) => translator.operator = operator,
            None => {
                tracing::warn!(handle = %handle, "operator installed on an unknown translator")
            }
        }
    }
}
