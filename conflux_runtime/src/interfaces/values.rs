//! Publication and input state for the value side of the interface graph.

use conflux_core::{GlobalHandle, Time};

use super::TargetInfo;

/// Core-side state of one publication.
#[derive(Debug, Default)]
pub struct PublicationInfo {
    /// Mirror of the input targets subscribed to this publication; value
    /// frames are cloned per entry at publish time.
    subscribers: Vec<TargetInfo>,
    /// Last published buffer, for change suppression.
    last_value: Option<Vec<u8>>,
    pub only_transmit_on_change: bool,
}

impl PublicationInfo {
    pub fn add_subscriber(&mut self, id: GlobalHandle, key: &str) {
        if !self.subscribers.iter().any(|t| t.id == id) {
            self.subscribers.push(TargetInfo {
                id,
                key: key.to_owned(),
            });
        }
    }

    pub fn remove_subscriber(&mut self, id: GlobalHandle) {
        self.subscribers.retain(|t| t.id != id);
    }

    pub fn subscribers(&self) -> &[TargetInfo] {
        &self.subscribers
    }

    /// Record a publish; returns false when change suppression drops it.
    pub fn publish(&mut self, data: &[u8]) -> bool {
        if self.only_transmit_on_change && self.last_value.as_deref() == Some(data) {
            return false;
        }
        self.last_value = Some(data.to_vec());
        true
    }
}

/// One stored value from one source publication.
#[derive(Debug, Clone)]
struct SourceValue {
    source: GlobalHandle,
    key: String,
    /// Values not yet visible at the federate's granted time, oldest first.
    pending: Vec<(Time, Vec<u8>)>,
    current: Option<Vec<u8>>,
    updated: bool,
}

/// Core-side state of one input.
#[derive(Debug, Default)]
pub struct InputInfo {
    sources: Vec<SourceValue>,
    default_value: Option<Vec<u8>>,
    pub only_update_on_change: bool,
}

impl InputInfo {
    pub fn add_source(&mut self, id: GlobalHandle, key: &str) {
        if !self.sources.iter().any(|s| s.source == id) {
            self.sources.push(SourceValue {
                source: id,
                key: key.to_owned(),
                pending: Vec::new(),
                current: None,
                updated: false,
            });
        }
    }

    pub fn remove_source(&mut self, id: GlobalHandle) {
        self.sources.retain(|s| s.source != id);
    }

    pub fn set_default(&mut self, data: Vec<u8>) {
        self.default_value = Some(data);
    }

    pub fn source_keys(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.key.as_str())
    }

    /// Store an arriving value stamped with the publisher's time. Unknown
    /// sources are admitted; a link notice may still be in flight.
    pub fn store(&mut self, source: GlobalHandle, time: Time, data: Vec<u8>) {
        let slot = match self.sources.iter_mut().find(|s| s.source == source) {
            Some(slot) => slot,
            None => {
                self.add_source(source, "");
                self.sources.last_mut().unwrap()
            }
        };
        let at = slot.pending.partition_point(|(t, _)| *t <= time);
        slot.pending.insert(at, (time, data));
    }

    /// Earliest pending stamp strictly after `after`, for event-driven
    /// grants.
    pub fn next_event_time(&self, after: Time) -> Time {
        self.sources
            .iter()
            .flat_map(|s| s.pending.iter().map(|(t, _)| *t))
            .filter(|t| *t > after)
            .min()
            .unwrap_or(Time::MAXIMUM)
    }

    /// Fold every value stamped `<= granted` into the current view.
    /// Returns whether the input is updated at this grant.
    pub fn apply_up_to(&mut self, granted: Time) -> bool {
        let mut any = false;
        for slot in &mut self.sources {
            let take = slot.pending.partition_point(|(t, _)| *t <= granted);
            if take == 0 {
                continue;
            }
            let (_, latest) = slot.pending.drain(..take).last().unwrap();
            let changed = slot.current.as_ref() != Some(&latest);
            if changed || !self.only_update_on_change {
                slot.updated = true;
                any = true;
            }
            slot.current = Some(latest);
        }
        any
    }

    /// Latest visible value, falling back to the default.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.sources
            .iter()
            .rev()
            .find_map(|s| s.current.clone())
            .or_else(|| self.default_value.clone())
    }

    pub fn clear_updated(&mut self) {
        for slot in &mut self.sources {
            slot.updated = false;
        }
    }

    pub fn is_updated(&self) -> bool {
        self.sources.iter().any(|s| s.updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::{GlobalFederateId, InterfaceHandle};

    fn handle(n: u32) -> GlobalHandle {
        GlobalHandle::new(GlobalFederateId::new(n), InterfaceHandle::new(0))
    }

    #[test]
    fn change_suppression_on_publish() {
        let mut publication = PublicationInfo {
            only_transmit_on_change: true,
            ..Default::default()
        };
        assert!(publication.publish(b"x"));
        assert!(!publication.publish(b"x"));
        assert!(publication.publish(b"y"));
    }

    #[test]
    fn values_become_visible_at_the_granted_time() {
        let mut input = InputInfo::default();
        input.store(handle(1), Time::from_seconds(1.0), b"a".to_vec());
        input.store(handle(1), Time::from_seconds(2.0), b"b".to_vec());

        assert!(input.value().is_none());
        assert!(input.apply_up_to(Time::from_seconds(1.0)));
        assert_eq!(input.value().unwrap(), b"a");

        assert!(input.apply_up_to(Time::from_seconds(5.0)));
        assert_eq!(input.value().unwrap(), b"b");
        assert_eq!(input.next_event_time(Time::from_seconds(5.0)), Time::MAXIMUM);
    }

    #[test]
    fn default_value_answers_before_any_update() {
        let mut input = InputInfo::default();
        input.set_default(b"fallback".to_vec());
        assert_eq!(input.value().unwrap(), b"fallback");
    }

    #[test]
    fn next_event_skips_visible_values() {
        let mut input = InputInfo::default();
        input.store(handle(1), Time::from_seconds(1.0), b"a".to_vec());
        input.store(handle(1), Time::from_seconds(3.0), b"b".to_vec());
        assert_eq!(input.next_event_time(Time::from_seconds(1.0)), Time::from_seconds(3.0));
        assert_eq!(input.next_event_time(Time::ZERO), Time::from_seconds(1.0));
    }

    #[test]
    fn update_on_change_only() {
        let mut input = InputInfo {
            only_update_on_change: true,
            ..Default::default()
        };
        input.store(handle(1), Time::from_seconds(1.0), b"same".to_vec());
        assert!(input.apply_up_to(Time::from_seconds(1.0)));
        input.clear_updated();
        input.store(handle(1), Time::from_seconds(2.0), b"same".to_vec());
        assert!(!input.apply_up_to(Time::from_seconds(2.0)));
    }
}
