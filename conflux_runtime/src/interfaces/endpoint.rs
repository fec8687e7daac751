//! Endpoint state: targets, filter bindings and the time-ordered queue of
//! pending messages.

use conflux_core::{GlobalHandle, Time};

use crate::message::Message;

use super::{FilterRef, TargetInfo};

/// Core-side state of one endpoint.
///
/// The queue is kept sorted by `(time, original_source)` with a stable
/// tie-break; `available` counts the prefix whose messages have been exposed
/// to the owning federate by a time update.
#[derive(Debug, Default)]
pub struct EndpointInfo {
    /// Destination targets for plain `send`.
    targets: Vec<TargetInfo>,
    /// Known source endpoints (informational, used by queries).
    sources: Vec<TargetInfo>,
    /// Filters applied to outbound messages, in binding order.
    pub source_filters: Vec<FilterRef>,
    /// Filters applied to inbound messages, in binding order.
    pub dest_filters: Vec<FilterRef>,
    /// Destination used by `send` when no target is named.
    pub default_dest: Option<String>,
    queue: Vec<Message>,
    available: usize,
}

impl EndpointInfo {
    /// Insert a message keeping `(time, original_source)` order. Equal keys
    /// keep arrival order.
    pub fn add_message(&mut self, message: Message) {
        let key = (message.time, message.original_source.as_str());
        let at = self
            .queue
            .partition_point(|m| (m.time, m.original_source.as_str()) <= key);
        self.queue.insert(at, message);
    }

    /// Expose messages strictly earlier than `new_time`. Returns whether the
    /// available count changed.
    pub fn update_time_up_to(&mut self, new_time: Time) -> bool {
        let index = self.queue.partition_point(|m| m.time < new_time);
        let changed = index != self.available;
        self.available = index;
        changed
    }

    /// Expose messages at or earlier than `new_time`.
    pub fn update_time_inclusive(&mut self, new_time: Time) -> bool {
        let index = self.queue.partition_point(|m| m.time <= new_time);
        let changed = index != self.available;
        self.available = index;
        changed
    }

    /// Pop the front message if it is exposed and not after `max_time`.
    pub fn get_message(&mut self, max_time: Time) -> Option<Message> {
        if self.available == 0 || self.queue.is_empty() {
            return None;
        }
        if self.queue[0].time <= max_time {
            self.available -= 1;
            Some(self.queue.remove(0))
        } else {
            None
        }
    }

    pub fn first_message_time(&self) -> Time {
        self.queue.first().map(|m| m.time).unwrap_or(Time::MAXIMUM)
    }

    /// Earliest queued time strictly after `after`; drives event grants.
    pub fn next_event_time(&self, after: Time) -> Time {
        self.queue
            .iter()
            .map(|m| m.time)
            .find(|t| *t > after)
            .unwrap_or(Time::MAXIMUM)
    }

    pub fn available_messages(&self) -> usize {
        self.available
    }

    /// Number of queued messages with `time <= max_time`.
    pub fn queue_size(&self, max_time: Time) -> usize {
        self.queue.partition_point(|m| m.time <= max_time)
    }

    /// Number of queued messages with `time < max_time`.
    pub fn queue_size_up_to(&self, max_time: Time) -> usize {
        self.queue.partition_point(|m| m.time < max_time)
    }

    pub fn clear_queue(&mut self) {
        self.available = 0;
        self.queue.clear();
    }

    pub fn add_destination(&mut self, id: GlobalHandle, key: &str) {
        if !self.targets.iter().any(|t| t.id == id) {
            self.targets.push(TargetInfo {
                id,
                key: key.to_owned(),
            });
        }
    }

    pub fn add_source(&mut self, id: GlobalHandle, key: &str) {
        if !self.sources.iter().any(|t| t.id == id) {
            self.sources.push(TargetInfo {
                id,
                key: key.to_owned(),
            });
        }
    }

    pub fn remove_target(&mut self, id: GlobalHandle) {
        self.targets.retain(|t| t.id != id);
        self.sources.retain(|t| t.id != id);
    }

    pub fn destinations(&self) -> &[TargetInfo] {
        &self.targets
    }

    pub fn sources(&self) -> &[TargetInfo] {
        &self.sources
    }

    pub fn has_source_filters(&self) -> bool {
        !self.source_filters.is_empty()
    }

    pub fn has_dest_filters(&self) -> bool {
        !self.dest_filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(source: &str, secs: f64) -> Message {
        Message::new(source, "dst", vec![0]).at(Time::from_seconds(secs))
    }

    #[test]
    fn queue_orders_by_time_then_original_source() {
        let mut ep = EndpointInfo::default();
        ep.add_message(msg("bbb", 2.0));
        ep.add_message(msg("aaa", 2.0));
        ep.add_message(msg("zzz", 1.0));

        ep.update_time_inclusive(Time::from_seconds(5.0));
        let order: Vec<_> = std::iter::from_fn(|| ep.get_message(Time::MAXIMUM))
            .map(|m| m.original_source)
            .collect();
        assert_eq!(order, vec!["zzz", "aaa", "bbb"]);
    }

    #[test]
    fn equal_keys_keep_arrival_order() {
        let mut ep = EndpointInfo::default();
        let mut first = msg("same", 1.0);
        first.message_id = 1;
        let mut second = msg("same", 1.0);
        second.message_id = 2;
        ep.add_message(first);
        ep.add_message(second);
        ep.update_time_inclusive(Time::from_seconds(1.0));
        assert_eq!(ep.get_message(Time::MAXIMUM).unwrap().message_id, 1);
        assert_eq!(ep.get_message(Time::MAXIMUM).unwrap().message_id, 2);
    }

    #[test]
    fn up_to_is_strict_and_inclusive_is_not() {
        let mut ep = EndpointInfo::default();
        ep.add_message(msg("a", 1.0));
        ep.add_message(msg("b", 2.0));

        ep.update_time_up_to(Time::from_seconds(2.0));
        assert_eq!(ep.available_messages(), 1);

        ep.update_time_inclusive(Time::from_seconds(2.0));
        assert_eq!(ep.available_messages(), 2);
    }

    #[test]
    fn get_message_respects_the_available_count() {
        let mut ep = EndpointInfo::default();
        ep.add_message(msg("a", 1.0));
        // Nothing exposed yet.
        assert!(ep.get_message(Time::MAXIMUM).is_none());

        ep.update_time_inclusive(Time::from_seconds(1.0));
        assert!(ep.get_message(Time::ZERO).is_none());
        assert!(ep.get_message(Time::from_seconds(1.0)).is_some());
        assert_eq!(ep.available_messages(), 0);
    }

    #[test]
    fn queue_sizes() {
        let mut ep = EndpointInfo::default();
        ep.add_message(msg("a", 1.0));
        ep.add_message(msg("b", 2.0));
        ep.add_message(msg("c", 3.0));
        assert_eq!(ep.queue_size(Time::from_seconds(2.0)), 2);
        assert_eq!(ep.queue_size_up_to(Time::from_seconds(2.0)), 1);
        assert_eq!(ep.first_message_time(), Time::from_seconds(1.0));
    }

    #[test]
    fn duplicate_targets_are_ignored() {
        use conflux_core::{GlobalFederateId, InterfaceHandle};
        let mut ep = EndpointInfo::default();
        let id = GlobalHandle::new(GlobalFederateId::new(7), InterfaceHandle::new(1));
        ep.add_destination(id, "x");
        ep.add_destination(id, "x");
        assert_eq!(ep.destinations().len(), 1);
        ep.remove_target(id);
        assert!(ep.destinations().is_empty());
    }
}
