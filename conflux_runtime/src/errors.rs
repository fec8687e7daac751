//! The error taxonomy shared by cores, brokers and the federate API.

/// Errors surfaced by the federation kernel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("registration failure: {0}")]
    Registration(String),

    #[error("unknown identifier: {0}")]
    InvalidIdentifier(String),

    #[error("operation not permitted in the current mode: {0}")]
    InvalidState(String),

    #[error("time grant deadline expired after {0} ms")]
    TimeCoordinationTimeout(u64),

    #[error("federate error {code}: {message}")]
    Local { code: i32, message: String },

    #[error("federation error {code}: {message}")]
    Global { code: i32, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wire error code for error-reply frames; the taxonomy survives a
    /// round trip through a frame's `counter` field.
    pub fn code(&self) -> u16 {
        match self {
            Error::Configuration(_) => 1,
            Error::Connection(_) => 2,
            Error::Registration(_) => 3,
            Error::InvalidIdentifier(_) => 4,
            Error::InvalidState(_) => 5,
            Error::TimeCoordinationTimeout(_) => 6,
            Error::Local { .. } => 7,
            Error::Global { .. } => 8,
            Error::Other(_) => 0,
        }
    }

    pub fn from_code(code: u16, message: String) -> Self {
        match code {
            1 => Error::Configuration(message),
            2 => Error::Connection(message),
            3 => Error::Registration(message),
            4 => Error::InvalidIdentifier(message),
            5 => Error::InvalidState(message),
            6 => Error::TimeCoordinationTimeout(message.parse().unwrap_or(0)),
            7 => Error::Local { code: 0, message },
            8 => Error::Global { code: 0, message },
            _ => Error::Other(anyhow::anyhow!(message)),
        }
    }
}
