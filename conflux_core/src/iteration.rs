use serde::{Deserialize, Serialize};

/// How a federate wants a time or mode request to handle iteration.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IterationRequest {
    /// Advance normally.
    #[default]
    NoIteration,
    /// Re-enter the current time unconditionally.
    ForceIteration,
    /// Re-enter the current time only if inputs changed there.
    IterateIfNeeded,
}

/// The outcome side of an iterative request.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// Time advanced to a new step.
    NextStep,
    /// The same time was re-granted with updated inputs.
    Iterating,
    /// The federation is shutting down.
    Halted,
    /// The request terminated because of an error.
    Error,
}

impl IterationRequest {
    pub fn wire(self) -> u16 {
        match self {
            Self::NoIteration => 0,
            Self::ForceIteration => 1,
            Self::IterateIfNeeded => 2,
        }
    }

    pub fn from_wire(raw: u16) -> Self {
        match raw {
            1 => Self::ForceIteration,
            2 => Self::IterateIfNeeded,
            _ => Self::NoIteration,
        }
    }
}
