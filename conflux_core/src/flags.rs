//! Flag bits carried on control frames and the federate flag options.

use serde::{Deserialize, Serialize};

/// Frame flag bits (the 2-byte `flags` wire field).
pub mod frame {
    /// Message has already passed its source filter chain.
    pub const FILTERED_SOURCE: u16 = 1 << 0;
    /// Message has already passed its destination filter chain.
    pub const FILTERED_DEST: u16 = 1 << 1;
    /// Message is a cloned copy produced by a cloning filter.
    pub const CLONE: u16 = 1 << 2;
    /// Registration names a globally-scoped key.
    pub const GLOBAL_KEY: u16 = 1 << 3;
    /// The source federate is synthetic (filter/translator federate).
    pub const SYNTHETIC: u16 = 1 << 4;
    /// Error frame applies to the whole federation.
    pub const GLOBAL_SCOPE: u16 = 1 << 5;
    /// Query/reply should bypass ordering with the normal queue.
    pub const FAST: u16 = 1 << 6;
    /// Interface registration that must not receive a duplicate-key check
    /// (used for the synthetic federate's internal interfaces).
    pub const INTERNAL: u16 = 1 << 7;
    /// Message is in flight to a filter host for destination-side
    /// processing rather than source-side.
    pub const DEST_PROCESS: u16 = 1 << 8;
}

/// Per-federate boolean options from the configuration surface.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FederateFlag {
    /// The federate never publishes or sends; it only observes.
    Observer,
    /// Time grants are never delivered earlier than requested.
    Uninterruptible,
    /// The federate only transmits; incoming interfaces are ignored.
    SourceOnly,
    /// Suppress publications whose value did not change.
    OnlyTransmitOnChange,
    /// Suppress input updates whose value did not change.
    OnlyUpdateOnChange,
    /// Wait for updates stamped at the current time before granting it.
    WaitForCurrentTimeUpdate,
    /// Use the stricter transitive-minimum grant rule.
    RestrictiveTimePolicy,
    /// Deliver messages stamped earlier than the granted time silently.
    IgnoreTimeMismatchWarnings,
    /// Hold the init barrier until the core is explicitly released.
    DelayInitEntry,
}

/// A federate's flag set. Small and copyable; lives inside the federate
/// configuration and the core-side federate state.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FederateFlags {
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

impl FederateFlags {
    pub fn set(&mut self, flag: FederateFlag, value: bool) {
        match flag {
            FederateFlag::Observer => self.observer = value,
            FederateFlag::Uninterruptible => self.uninterruptible = value,
            FederateFlag::SourceOnly => self.source_only = value,
            FederateFlag::OnlyTransmitOnChange => self.only_transmit_on_change = value,
            FederateFlag::OnlyUpdateOnChange => self.only_update_on_change = value,
            FederateFlag::WaitForCurrentTimeUpdate => self.wait_for_current_time_update = value,
            FederateFlag::RestrictiveTimePolicy => self.restrictive_time_policy = value,
            FederateFlag::IgnoreTimeMismatchWarnings => {
                self.ignore_time_mismatch_warnings = value
            }
            FederateFlag::DelayInitEntry => self.delay_init_entry = value,
        }
    }

    pub fn get(&self, flag: FederateFlag) -> bool {
        match flag {
            FederateFlag::Observer => self.observer,
            FederateFlag::Uninterruptible => self.uninterruptible,
            FederateFlag::SourceOnly => self.source_only,
            FederateFlag::OnlyTransmitOnChange => self.only_transmit_on_change,
            FederateFlag::OnlyUpdateOnChange => self.only_update_on_change,
            FederateFlag::WaitForCurrentTimeUpdate => self.wait_for_current_time_update,
            FederateFlag::RestrictiveTimePolicy => self.restrictive_time_policy,
            FederateFlag::IgnoreTimeMismatchWarnings => self.ignore_time_mismatch_warnings,
            FederateFlag::DelayInitEntry => self.delay_init_entry,
        }
    }
}
