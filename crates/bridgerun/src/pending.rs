//! # Pending-Call Table
//!
//! Makes an asynchronous, unordered channel look like awaitable calls.
//!
//! Every remote call registers a `PendingCall` under a fresh correlation id and
//! gets back a `PendingReply` future. The call is settled exactly once, by
//! whichever of these removes it from the table first:
//!
//! - a `response` envelope echoing its id (`settle`),
//! - its timeout timer,
//! - loss of the link it was sent on (`fail_link`),
//! - bridge teardown (`teardown`).
//!
//! Removal from the `DashMap` is the single arbitration point, so a late
//! response for an expired call finds nothing and is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bridgewire::CorrelationId;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::bridge::LinkId;
use crate::error::Error;
use crate::error::Result;

struct PendingCall {
    tx: oneshot::Sender<Result<Value>>,
    created_at: u64,
    link: Option<LinkId>,
    timeout: Option<JoinHandle<()>>,
}

struct Inner {
    calls: DashMap<CorrelationId, PendingCall>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-flight remote calls of one context, keyed by correlation id.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct PendingCalls {
    inner: Arc<Inner>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                calls: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Allocates a correlation id and starts its timeout.
    ///
    /// Ids are strictly increasing and never reused. Fails with
    /// `BridgeDestroyed` once the table has been torn down.
    pub fn register(
        &self,
        timeout: Duration,
        link: Option<LinkId>,
    ) -> Result<(CorrelationId, PendingReply)> {
        if self.is_closed() {
            return Err(Error::BridgeDestroyed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.calls.insert(id, PendingCall {
            tx,
            created_at: bridgewire::now_millis(),
            link,
            timeout: None,
        });

        // A teardown that raced with the insert has already swept the table.
        if self.is_closed() {
            self.inner.calls.remove(&id);
            return Err(Error::BridgeDestroyed);
        }

        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, id);
        });

        match self.inner.calls.get_mut(&id) {
            Some(mut call) => call.timeout = Some(timer),
            None => timer.abort(),
        }

        Ok((id, PendingReply { id, rx }))
    }

    /// Settles the call registered under `id`.
    ///
    /// Returns `false` if there is no such call (unknown id, or already
    /// settled); the outcome is then discarded.
    pub fn settle(&self, id: CorrelationId, outcome: Result<Value>) -> bool {
        let Some((_, call)) = self.inner.calls.remove(&id) else {
            return false;
        };
        if let Some(timer) = call.timeout {
            timer.abort();
        }
        let _ = call.tx.send(outcome);
        true
    }

    /// Forgets a call without settling it; its reply resolves to
    /// `BridgeDestroyed` if anyone still awaits it.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let Some((_, call)) = self.inner.calls.remove(&id) else {
            return false;
        };
        if let Some(timer) = call.timeout {
            timer.abort();
        }
        true
    }

    /// Rejects every call that was sent over `link`.
    pub fn fail_link(&self, link: LinkId, error: Error) -> usize {
        let ids: Vec<CorrelationId> = self
            .inner
            .calls
            .iter()
            .filter(|entry| entry.link == Some(link))
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter(|id| self.settle(*id, Err(error.clone())))
            .count()
    }

    /// Rejects all outstanding calls with `BridgeDestroyed` and refuses new
    /// ones. Returns how many calls were rejected.
    pub fn teardown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<CorrelationId> = self.inner.calls.iter().map(|entry| *entry.key()).collect();
        let rejected = ids
            .into_iter()
            .filter(|id| self.settle(*id, Err(Error::BridgeDestroyed)))
            .count();
        debug!(rejected, "pending-call table torn down");
        rejected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.calls.is_empty()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.inner.calls.contains_key(&id)
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

fn expire(inner: &Weak<Inner>, id: CorrelationId) {
    let Some(inner) = inner.upgrade() else { return };
    let Some((_, call)) = inner.calls.remove(&id) else { return };

    let waited = bridgewire::now_millis().saturating_sub(call.created_at);
    warn!(id, waited_ms = waited, "remote call timed out");
    let _ = call.tx.send(Err(Error::CallTimeout));
}

/// Resolves when the call registered under `id()` is settled.
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::BridgeDestroyed)))
    }
}
