//! The recognized per-federate configuration surface.
//!
//! Time values are in seconds, matching the numeric option set external
//! configuration files surface. File loading itself lives outside the
//! kernel; this structure is what a loader deserializes into.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use conflux_core::flags::FederateFlags;
use conflux_core::Time;
use conflux_runtime::coordination::TimeProperties;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FederateConfig {
    pub name: String,

    // Time properties, in seconds.
    pub period: f64,
    pub offset: f64,
    pub time_delta: f64,
    pub input_delay: f64,
    pub output_delay: f64,
    /// Real-time pacing bounds; recognized for compatibility, pacing is a
    /// runner concern.
    pub rt_lag: f64,
    pub rt_lead: f64,

    pub max_iterations: u32,
    /// Wall-clock bound on a blocked time request, in milliseconds.
    pub grant_timeout: Option<u64>,

    // Flags.
    pub observer: bool,
    pub uninterruptible: bool,
    pub source_only: bool,
    pub only_transmit_on_change: bool,
    pub only_update_on_change: bool,
    pub wait_for_current_time_update: bool,
    pub restrictive_time_policy: bool,
    pub ignore_time_mismatch_warnings: bool,
    pub delay_init_entry: bool,
}

impl Default for FederateConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            period: 0.0,
            offset: 0.0,
            time_delta: 0.0,
            input_delay: 0.0,
            output_delay: 0.0,
            rt_lag: 0.0,
            rt_lead: 0.0,
            max_iterations: 50,
            grant_timeout: None,
            observer: false,
            uninterruptible: false,
            source_only: false,
            only_transmit_on_change: false,
            only_update_on_change: false,
            wait_for_current_time_update: false,
            restrictive_time_policy: false,
            ignore_time_mismatch_warnings: false,
            delay_init_entry: false,
        }
    }
}

impl FederateConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn time_properties(&self) -> TimeProperties {
        TimeProperties {
            period: Time::from_seconds(self.period),
            offset: Time::from_seconds(self.offset),
            time_delta: Time::from_seconds(self.time_delta).max(Time::EPSILON),
            input_delay: Time::from_seconds(self.input_delay),
            output_delay: Time::from_seconds(self.output_delay),
            grant_timeout: self.grant_timeout.map(Duration::from_millis),
            max_iterations: self.max_iterations,
        }
    }

    pub fn federate_flags(&self) -> FederateFlags {
        FederateFlags {
            observer: self.observer,
            uninterruptible: self.uninterruptible,
            source_only: self.source_only,
            only_transmit_on_change: self.only_transmit_on_change,
            only_update_on_change: self.only_update_on_change,
            wait_for_current_time_update: self.wait_for_current_time_update,
            restrictive_time_policy: self.restrictive_time_policy,
            ignore_time_mismatch_warnings: self.ignore_time_mismatch_warnings,
            delay_init_entry: self.delay_init_entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_a_minimal_time_step() {
        let config = FederateConfig::named("f");
        let props = config.time_properties();
        assert_eq!(props.time_delta, Time::EPSILON);
        assert_eq!(props.period, Time::ZERO);
        assert!(props.grant_timeout.is_none());
    }

    #[test]
    fn json_round_trip_preserves_options() {
        let raw = r#"{
            "name": "battery",
            "period": 1.0,
            "offset": 0.25,
            "input_delay": 0.1,
            "grant_timeout": 5000,
            "uninterruptible": true,
            "delay_init_entry": true
        }"#;
        let config: FederateConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.name, "battery");
        assert_eq!(config.time_properties().period, Time::from_seconds(1.0));
        assert_eq!(
            config.time_properties().grant_timeout,
            Some(Duration::from_millis(5000))
        );
        let flags = config.federate_flags();
        assert!(flags.uninterruptible);
        assert!(flags.delay_init_entry);
        assert!(!flags.observer);
    }
}
