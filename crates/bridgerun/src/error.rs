//! # Bridge Errors
//!
//! The taxonomy shared by the pending-call table, the readiness gate and the
//! peer links. Errors are `Clone` because a single failure (a readiness
//! timeout, a teardown) may have to reject many waiters at once.

use crate::asset;
use crate::transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The module (or runtime loader) bytes could not be fetched.
    Fetch(asset::Error),
    /// The binary failed to compile, link, or start.
    Instantiation(String),
    /// No readiness signal was observed in time.
    ReadinessTimeout,
    /// A remote call received no response in time.
    CallTimeout,
    /// No callback token, capability or module export has this name.
    UnknownFunction(String),
    /// The bridge (or the gate) was torn down.
    BridgeDestroyed,
    /// Sending to a context failed, or its channel closed.
    Transport(transport::Error),
    /// The callee ran and reported an error.
    Remote(String),
    /// The module's last initialization failed; carries the reason.
    ModuleFailed(String),
    /// An envelope could not be encoded.
    Codec(bridgewire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "Fetch error: {}", e),
            Self::Instantiation(msg) => write!(f, "Instantiation error: {}", msg),
            Self::ReadinessTimeout => write!(f, "Module did not become ready in time"),
            Self::CallTimeout => write!(f, "Call timed out"),
            Self::UnknownFunction(name) => write!(f, "Unknown function '{}'", name),
            Self::BridgeDestroyed => write!(f, "Bridge has been destroyed"),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Remote(msg) => write!(f, "Remote error: {}", msg),
            Self::ModuleFailed(reason) => write!(f, "Module failed to initialize: {}", reason),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<asset::Error> for Error {
    fn from(e: asset::Error) -> Self {
        Self::Fetch(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<bridgewire::Error> for Error {
    fn from(e: bridgewire::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
