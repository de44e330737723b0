//! # Transport Abstraction
//!
//! A minimal, async interface for moving envelopes between contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about envelopes or calls.
//!   It moves opaque buffers.
//! - **Fire-and-Forget**: `send` never waits for an answer and `recv` gives no
//!   ordering promise relative to what was sent. Correlation is built on top.

use std::fmt;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer context is gone or the channel was dropped.
    ConnectionLost(String),
    /// The handle no longer refers to a live context.
    DeadHandle(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::DeadHandle(msg) => write!(f, "Dead handle: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex, message-oriented channel to one other context.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`). `send` and
/// `recv` may be driven concurrently from different tasks.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one message for the other side.
    ///
    /// # invariants
    /// - Must not interpret the payload content.
    /// - Must return `Err` if the message can no longer be delivered.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next inbound message. `Ok(None)` means the other side
    /// closed the channel and nothing more will arrive.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}
