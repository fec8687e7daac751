//! The addressed message that flows between endpoints.

use serde::{Deserialize, Serialize};

use conflux_core::Time;

/// A time-stamped message addressed between endpoints.
///
/// `original_source` and `original_dest` survive filter rewrites: a reroute
/// or clone changes `dest`, a source rewrite changes `source`, but the
/// originals always name the endpoints the user addressed. Delivery order at
/// an endpoint is `(time, original_source)` with a stable tie-break.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: String,
    pub original_source: String,
    pub dest: String,
    pub original_dest: String,
    pub time: Time,
    pub message_id: u32,
    pub flags: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(source: impl Into<String>, dest: impl Into<String>, payload: Vec<u8>) -> Self {
        let source = source.into();
        let dest = dest.into();
        Self {
            original_source: source.clone(),
            original_dest: dest.clone(),
            source,
            dest,
            time: Time::ZERO,
            message_id: 0,
            flags: 0,
            payload,
        }
    }

    pub fn at(mut self, time: Time) -> Self {
        self.time = time;
        self
    }

    /// Serialize for a `Message` frame payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// The sort key used by endpoint queues.
    pub fn order_key(&self) -> (Time, &str) {
        (self.time, &self.original_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn originals_default_to_the_addressed_endpoints() {
        let msg = Message::new("fedA/port1", "fedB/port2", vec![1, 2, 3]);
        assert_eq!(msg.original_source, "fedA/port1");
        assert_eq!(msg.original_dest, "fedB/port2");
    }

    #[test]
    fn frame_payload_round_trip() {
        let msg = Message::new("a", "b", vec![9; 500]).at(Time::from_seconds(2.5));
        let back = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(back, msg);
    }
}
