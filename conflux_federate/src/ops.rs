//! Built-in filter operators and translators.

use conflux_core::Time;
use conflux_runtime::interfaces::{FilterOperator, FilterResult, TranslatorOperator};
use conflux_runtime::message::Message;

/// Delays every message by a fixed amount of simulation time. The delay is
/// reported into the dependency graph so downstream federates are held
/// back accordingly.
pub struct DelayFilter {
    delay: Time,
}

impl DelayFilter {
    pub fn new(delay: Time) -> Self {
        Self { delay }
    }
}

impl FilterOperator for DelayFilter {
    fn process(&self, mut message: Message) -> FilterResult {
        message.time = message.time + self.delay;
        FilterResult::Pass(message)
    }

    fn time_shift(&self) -> Time {
        self.delay
    }
}

/// Drops each message independently with the configured probability.
pub struct RandomDropFilter {
    probability: f64,
}

impl RandomDropFilter {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl FilterOperator for RandomDropFilter {
    fn process(&self, message: Message) -> FilterResult {
        if rand::random::<f64>() < self.probability {
            FilterResult::Drop
        } else {
            FilterResult::Pass(message)
        }
    }
}

/// Redirects matching messages to a new destination. With a condition, only
/// messages whose destination name contains the condition string are
/// rerouted; the original destination stays visible as `original_dest`.
pub struct RerouteFilter {
    new_destination: String,
    condition: Option<String>,
}

impl RerouteFilter {
    pub fn new(new_destination: impl Into<String>) -> Self {
        Self {
            new_destination: new_destination.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

impl FilterOperator for RerouteFilter {
    fn process(&self, mut message: Message) -> FilterResult {
        let matches = self
            .condition
            .as_ref()
            .map(|c| message.dest.contains(c.as_str()))
            .unwrap_or(true);
        if matches {
            message.dest = self.new_destination.clone();
        }
        FilterResult::Pass(message)
    }
}

/// Operator for cloning filters: passes the primary message untouched and
/// lets every delivery endpoint receive a copy.
pub struct CloneFilter;

impl FilterOperator for CloneFilter {
    fn process(&self, message: Message) -> FilterResult {
        FilterResult::Pass(message)
    }
}

/// Wrap a closure as a filter operator.
pub fn filter_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(Message) -> FilterResult + Send + Sync,
{
    FnFilter(f)
}

pub struct FnFilter<F>(F);

impl<F> FilterOperator for FnFilter<F>
where
    F: Fn(Message) -> FilterResult + Send + Sync,
{
    fn process(&self, message: Message) -> FilterResult {
        (self.0)(message)
    }
}

/// JSON translator: values become `{"value": [bytes...]}` message payloads
/// and back. Lossless for arbitrary byte values.
pub struct JsonTranslator;

impl TranslatorOperator for JsonTranslator {
    fn value_to_message(&self, value: &[u8]) -> Vec<u8> {
        serde_json::json!({ "value": value }).to_string().into_bytes()
    }

    fn message_to_value(&self, payload: &[u8]) -> Vec<u8> {
        serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| {
                v.get("value").and_then(|value| {
                    value.as_array().map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_u64().map(|b| b as u8))
                            .collect()
                    })
                })
            })
            .unwrap_or_else(|| payload.to_vec())
    }
}

/// Binary translator: the compact serialized encoding of the value bytes.
pub struct BinaryTranslator;

impl TranslatorOperator for BinaryTranslator {
    fn value_to_message(&self, value: &[u8]) -> Vec<u8> {
        bincode::serialize(value).expect("byte buffers serialize")
    }

    fn message_to_value(&self, payload: &[u8]) -> Vec<u8> {
        bincode::deserialize::<Vec<u8>>(payload).unwrap_or_else(|_| payload.to_vec())
    }
}

/// Wrap a pair of closures as a translator.
pub fn translator_fn<E, D>(encode: E, decode: D) -> FnTranslator<E, D>
where
    E: Fn(&[u8]) -> Vec<u8> + Send + Sync,
    D: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    FnTranslator { encode, decode }
}

pub struct FnTranslator<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> TranslatorOperator for FnTranslator<E, D>
where
    E: Fn(&[u8]) -> Vec<u8> + Send + Sync,
    D: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    fn value_to_message(&self, value: &[u8]) -> Vec<u8> {
        (self.encode)(value)
    }

    fn message_to_value(&self, payload: &[u8]) -> Vec<u8> {
        (self.decode)(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(dest: &str) -> Message {
        Message::new("src", dest, vec![1, 2, 3]).at(Time::from_seconds(1.0))
    }

    #[test]
    fn delay_shifts_time_and_reports_it() {
        let filter = DelayFilter::new(Time::from_seconds(2.5));
        assert_eq!(filter.time_shift(), Time::from_seconds(2.5));
        match filter.process(msg("dst")) {
            FilterResult::Pass(m) => assert_eq!(m.time, Time::from_seconds(3.5)),
            FilterResult::Drop => panic!("delay must not drop"),
        }
    }

    #[test]
    fn reroute_honors_the_condition() {
        let filter = RerouteFilter::new("port3").with_condition("end");
        match filter.process(msg("endpt2")) {
            FilterResult::Pass(m) => {
                assert_eq!(m.dest, "port3");
                assert_eq!(m.original_dest, "endpt2");
            }
            FilterResult::Drop => panic!("reroute must not drop"),
        }
        match filter.process(msg("other")) {
            FilterResult::Pass(m) => assert_eq!(m.dest, "other"),
            FilterResult::Drop => panic!("reroute must not drop"),
        }
    }

    #[test]
    fn drop_probabilities_at_the_extremes() {
        let always = RandomDropFilter::new(1.0);
        for _ in 0..32 {
            assert!(matches!(always.process(msg("d")), FilterResult::Drop));
        }
        let never = RandomDropFilter::new(0.0);
        for _ in 0..32 {
            assert!(matches!(never.process(msg("d")), FilterResult::Pass(_)));
        }
    }

    #[test]
    fn json_translator_round_trips_bytes() {
        let translator = JsonTranslator;
        let value = vec![0u8, 7, 255, 42];
        let encoded = translator.value_to_message(&value);
        assert!(serde_json::from_slice::<serde_json::Value>(&encoded).is_ok());
        assert_eq!(translator.message_to_value(&encoded), value);
    }

    #[test]
    fn binary_translator_round_trips_bytes() {
        let translator = BinaryTranslator;
        let value = vec![9u8; 500];
        let encoded = translator.value_to_message(&value);
        assert_eq!(translator.message_to_value(&encoded), value);
    }
}
