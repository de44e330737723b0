//! In-process channel transport.
//!
//! Connects two contexts living in the same process (a host task and a
//! worker task, say) with a pair of unbounded tokio channels. Either end can
//! be closed explicitly, which the other end observes as end-of-stream.

use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::mpsc;
use tracing::trace;

use crate::transport;
use crate::transport::Transport;

/// One end of an in-process duplex channel.
pub struct ChannelTransport {
    label: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new(
        label: impl Into<String>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            label: label.into(),
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        Self::labeled_pair("a", "b")
    }

    pub fn labeled_pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        (Self::new(a, to_b, from_b), Self::new(b, to_a, from_a))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stops sending. The other end's `recv` yields `None` once it has
    /// drained what was already sent.
    pub fn close(&self) {
        let closed = self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        if closed.is_some() {
            trace!(label = %self.label, "channel end closed");
        }
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return Err(transport::Error::ConnectionLost(format!("{} is closed", self.label)));
        };
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost(format!("peer of {} is gone", self.label)))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.inbound.lock().await.recv().await)
    }
}
