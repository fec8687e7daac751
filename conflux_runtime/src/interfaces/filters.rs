//! Filter and translator state, and the operator contracts.
//!
//! Operators run on the hosting core's synthetic federate, at the message's
//! effective time; they never see transport or routing state.

use std::sync::Arc;

use conflux_core::{GlobalHandle, Time};

use crate::message::Message;

use super::TargetInfo;

/// Outcome of running a non-cloning filter operator on one message.
#[derive(Debug)]
pub enum FilterResult {
    /// Pass the (possibly rewritten) message on.
    Pass(Message),
    /// Drop the message entirely.
    Drop,
}

/// A message filter operator.
///
/// `process` may rewrite time, destination or payload. `original_source`
/// and `original_dest` rewrites are ignored by the kernel. `time_shift`
/// advertises the minimum time the operator adds to messages; it widens the
/// coupling delay of every edge routed through the filter.
pub trait FilterOperator: Send + Sync {
    fn process(&self, message: Message) -> FilterResult;

    fn time_shift(&self) -> Time {
        Time::ZERO
    }

    /// Clone targets for cloning filters: which of the delivery endpoints
    /// receive a copy of this message. Default: all of them.
    fn clone_condition(&self, _message: &Message) -> bool {
        true
    }
}

/// A translator operator: bridges the value and message domains.
pub trait TranslatorOperator: Send + Sync {
    /// Encode a value update into a message payload.
    fn value_to_message(&self, value: &[u8]) -> Vec<u8>;
    /// Decode a message payload into a published value.
    fn message_to_value(&self, payload: &[u8]) -> Vec<u8>;
}

/// Core-side state of one filter.
pub struct FilterInfo {
    pub cloning: bool,
    /// Endpoints whose outbound messages route through this filter.
    pub source_endpoints: Vec<TargetInfo>,
    /// Endpoints whose inbound messages route through this filter.
    pub dest_endpoints: Vec<TargetInfo>,
    /// Delivery endpoints for cloning filters.
    pub delivery: Vec<String>,
    pub operator: Option<Arc<dyn FilterOperator>>,
    /// Time contribution last reported into the dependency graph.
    pub reported_shift: Time,
}

impl FilterInfo {
    pub fn new(cloning: bool) -> Self {
        Self {
            cloning,
            source_endpoints: Vec::new(),
            dest_endpoints: Vec::new(),
            delivery: Vec::new(),
            operator: None,
            reported_shift: Time::ZERO,
        }
    }

    pub fn add_delivery(&mut self, endpoint: &str) {
        if !self.delivery.iter().any(|d| d == endpoint) {
            self.delivery.push(endpoint.to_owned());
        }
    }

    pub fn remove_delivery(&mut self, endpoint: &str) {
        self.delivery.retain(|d| d != endpoint);
    }
}

impl std::fmt::Debug for FilterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterInfo")
            .field("cloning", &self.cloning)
            .field("source_endpoints", &self.source_endpoints)
            .field("dest_endpoints", &self.dest_endpoints)
            .field("delivery", &self.delivery)
            .field("has_operator", &self.operator.is_some())
            .finish()
    }
}

/// Core-side state of one translator: a publication side, an input side and
/// an endpoint side under a single handle.
pub struct TranslatorInfo {
    /// Inputs subscribed to the translator's publication side.
    pub value_subscribers: Vec<TargetInfo>,
    /// Endpoints the translator's endpoint side sends to.
    pub message_targets: Vec<TargetInfo>,
    pub operator: Option<Arc<dyn TranslatorOperator>>,
}

impl TranslatorInfo {
    pub fn new() -> Self {
        Self {
            value_subscribers: Vec::new(),
            message_targets: Vec::new(),
            operator: None,
        }
    }

    pub fn add_value_subscriber(&mut self, id: GlobalHandle, key: &str) {
        if !self.value_subscribers.iter().any(|t| t.id == id) {
            self.value_subscribers.push(TargetInfo {
                id,
                key: key.to_owned(),
            });
        }
    }

    pub fn add_message_target(&mut self, id: GlobalHandle, key: &str) {
        if !self.message_targets.iter().any(|t| t.id == id) {
            self.message_targets.push(TargetInfo {
                id,
                key: key.to_owned(),
            });
        }
    }
}

impl Default for TranslatorInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TranslatorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorInfo")
            .field("value_subscribers", &self.value_subscribers)
            .field("message_targets", &self.message_targets)
            .field("has_operator", &self.operator.is_some())
            .finish()
    }
}
