//! Coarse lifecycle events for an external UI layer.

use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Loading,
    Ready { functions: Vec<String> },
    Failed { reason: String },
}

/// Receives lifecycle events. Implementations must not block.
pub trait StatusSink: Send + Sync + 'static {
    fn emit(&self, status: Status);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _status: Status) {}
}

/// Forwards events to an unbounded channel; a dropped receiver is ignored.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Status>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Status>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn emit(&self, status: Status) {
        let _ = self.tx.send(status);
    }
}
