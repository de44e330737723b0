//! # Error Definitions

/// Failures turning bytes into envelopes and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bytes are not a JSON object with a string `cmd`.
    Malformed(String),
    /// A well-formed message addressed to some other subsystem.
    UnknownCommand(String),
    /// A field required by the command is absent.
    MissingField(&'static str),
    /// Serialization failed (e.g. a non-finite float in the payload).
    Encode(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
            Self::UnknownCommand(cmd) => write!(f, "unknown command '{}'", cmd),
            Self::MissingField(field) => write!(f, "envelope is missing '{}'", field),
            Self::Encode(msg) => write!(f, "failed to encode envelope: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
