//! Core-side federate state and the operating-mode machine.

use conflux_core::flags::FederateFlags;
use conflux_core::{GlobalFederateId, IterationRequest, LocalFederateId};

use crate::coordination::{TimeCoordinator, TimeProperties};
use crate::errors::Error;

/// Operating modes of a federate. `Finalize` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederateMode {
    Created,
    Initializing,
    Executing,
    Finalize,
    Error,
}

impl FederateMode {
    /// Whether a transition to `next` is allowed from this mode.
    pub fn can_enter(self, next: FederateMode) -> bool {
        use FederateMode::*;
        match (self, next) {
            (Created, Initializing) | (Initializing, Executing) => true,
            // Finalize and Error are reachable from every non-terminal mode,
            // and idempotently from themselves.
            (_, Finalize) => !matches!(self, Error),
            (_, Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FederateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FederateMode::Created => "created",
            FederateMode::Initializing => "initializing",
            FederateMode::Executing => "executing",
            FederateMode::Finalize => "finalize",
            FederateMode::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A blocked `request_time` call.
#[derive(Debug)]
pub struct PendingTime {
    pub message_id: u32,
    pub deadline: Option<tokio::time::Instant>,
}

/// A blocked `enter_executing_mode` call.
#[derive(Debug)]
pub struct PendingExec {
    pub message_id: u32,
    pub iterate: IterationRequest,
}

/// Everything a core tracks for one local federate. Owned exclusively by
/// the core's command task; the public API only sees posted snapshots.
#[derive(Debug)]
pub struct FederateState {
    pub name: String,
    pub local_id: LocalFederateId,
    pub global_id: GlobalFederateId,
    pub mode: FederateMode,
    pub flags: FederateFlags,
    pub coordinator: TimeCoordinator,
    /// Synthetic federates host filter/translator operators and never have
    /// user-issued requests.
    pub synthetic: bool,
    pub init_ready: bool,
    pub pending_init: Option<u32>,
    pub pending_exec: Option<PendingExec>,
    pub pending_time: Option<PendingTime>,
    /// Inputs or messages arrived stamped exactly at the granted time since
    /// the last grant; drives `IterateIfNeeded`.
    pub updated_at_granted: bool,
    pub error: Option<(i32, String)>,
}

impl FederateState {
    pub fn new(
        name: impl Into<String>,
        local_id: LocalFederateId,
        props: TimeProperties,
        flags: FederateFlags,
        synthetic: bool,
    ) -> Self {
        Self {
            name: name.into(),
            local_id,
            global_id: GlobalFederateId::INVALID,
            mode: FederateMode::Created,
            flags,
            coordinator: TimeCoordinator::new(GlobalFederateId::INVALID, props, flags),
            synthetic,
            init_ready: false,
            pending_init: None,
            pending_exec: None,
            pending_time: None,
            updated_at_granted: false,
            error: None,
        }
    }

    /// Transition, rejecting anything the mode machine does not allow.
    pub fn enter(&mut self, next: FederateMode) -> Result<(), Error> {
        if self.mode == next {
            return Ok(());
        }
        if !self.mode.can_enter(next) {
            return Err(Error::InvalidState(format!(
                "federate {} cannot move from {} to {next}",
                self.name, self.mode
            )));
        }
        tracing::debug!(federate = %self.name, from = %self.mode, to = %next, "mode change");
        self.mode = next;
        Ok(())
    }

    /// Whether API traffic other than finalize/disconnect is acceptable.
    pub fn check_operational(&self) -> Result<(), Error> {
        match self.mode {
            FederateMode::Error => Err(self
                .error
                .clone()
                .map(|(code, message)| Error::Local { code, message })
                .unwrap_or_else(|| {
                    Error::InvalidState(format!("federate {} is in the error state", self.name))
                })),
            FederateMode::Finalize => Err(Error::InvalidState(format!(
                "federate {} is finalized",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed() -> FederateState {
        FederateState::new(
            "f",
            LocalFederateId::new(1),
            TimeProperties::default(),
            FederateFlags::default(),
            false,
        )
    }

    #[test]
    fn lifecycle_follows_the_mode_machine() {
        let mut f = fed();
        assert!(f.enter(FederateMode::Executing).is_err());
        f.enter(FederateMode::Initializing).unwrap();
        f.enter(FederateMode::Executing).unwrap();
        f.enter(FederateMode::Finalize).unwrap();
        // Terminal: no way back.
        assert!(f.enter(FederateMode::Executing).is_err());
        // Re-entering the terminal state is idempotent.
        f.enter(FederateMode::Finalize).unwrap();
    }

    #[test]
    fn error_is_reachable_from_anywhere_but_not_leavable() {
        let mut f = fed();
        f.enter(FederateMode::Error).unwrap();
        assert!(f.enter(FederateMode::Finalize).is_err());
        assert!(f.check_operational().is_err());
    }

    #[test]
    fn finalize_from_created() {
        let mut f = fed();
        f.enter(FederateMode::Finalize).unwrap();
        assert!(f.check_operational().is_err());
    }
}
