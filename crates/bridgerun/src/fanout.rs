//! # Worker Fan-out
//!
//! Sends one logical message to every live worker of an engine host. Each
//! worker gets its own stamped copy (fresh sequence id, its index, a fresh
//! timestamp). A failure to reach one worker is logged and counted; it never
//! stops delivery to the others.
//!
//! `broadcast` is fire-and-forget. `call_all` and `sync_all` also register a
//! correlated pending call per worker, so the caller can await every reply.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridgewire::Envelope;
use bridgewire::SyncData;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::bridge::Bridge;
use crate::bridge::Peer;
use crate::callback::CallArg;
use crate::callback::CallbackRegistry;
use crate::callback::Lease;
use crate::error::Result;
use crate::pending::PendingCalls;
use crate::pending::PendingReply;
use crate::transport;
use crate::transport::Transport;

/// Strong type for worker identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A live worker as seen at the moment of a fan-out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    /// Position among the live workers; stamped as the target index.
    pub index: u32,
}

/// Owner of the worker set. Membership is the host's business; fan-out
/// only reads it.
#[async_trait::async_trait]
pub trait EngineHost: Send + Sync + 'static {
    fn live_workers(&self) -> Vec<WorkerHandle>;
    async fn send(&self, worker: WorkerHandle, bytes: &[u8]) -> transport::Result<()>;
}

/// An `EngineHost` over a set of transports.
#[derive(Default)]
pub struct TransportPool {
    workers: RwLock<Vec<(WorkerId, Arc<dyn Transport>)>>,
}

impl TransportPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, id: WorkerId, transport: Arc<dyn Transport>) {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|(existing, _)| *existing != id);
        workers.push((id, transport));
        debug!(worker = %id, live = workers.len(), "worker added");
    }

    /// Adds the worker and attaches its transport to `bridge`, so replies
    /// and calls coming back from it are routed.
    pub fn connect(&self, bridge: &Bridge, id: WorkerId, transport: Arc<dyn Transport>) -> Peer {
        self.add_worker(id, transport.clone());
        bridge.attach(transport)
    }

    pub fn remove_worker(&self, id: WorkerId) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let before = workers.len();
        workers.retain(|(existing, _)| *existing != id);
        let removed = workers.len() != before;
        if removed {
            debug!(worker = %id, live = workers.len(), "worker removed");
        }
        removed
    }

    fn transport(&self, id: WorkerId) -> Option<Arc<dyn Transport>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, transport)| transport.clone())
    }
}

#[async_trait::async_trait]
impl EngineHost for TransportPool {
    fn live_workers(&self) -> Vec<WorkerHandle> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .map(|(index, (id, _))| WorkerHandle {
                id: *id,
                index: index as u32,
            })
            .collect()
    }

    async fn send(&self, worker: WorkerHandle, bytes: &[u8]) -> transport::Result<()> {
        let transport = self
            .transport(worker.id)
            .ok_or_else(|| transport::Error::DeadHandle(worker.id.to_string()))?;
        transport.send(bytes).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    pub success_count: usize,
    pub error_count: usize,
    pub total_workers: usize,
}

pub struct WorkerReply {
    pub worker: WorkerHandle,
    pub reply: PendingReply,
}

/// Replies to an acknowledged fan-out, one per worker that was reached.
pub struct FanoutCall {
    pub summary: FanoutSummary,
    pub replies: Vec<WorkerReply>,
    lease: Lease,
}

impl FanoutCall {
    /// Awaits every reply. Leased callbacks are revoked afterwards.
    pub async fn join(self) -> Vec<(WorkerHandle, Result<Value>)> {
        let FanoutCall { replies, lease, .. } = self;
        let results = futures::future::join_all(
            replies
                .into_iter()
                .map(|WorkerReply { worker, reply }| async move { (worker, reply.await) }),
        )
        .await;
        drop(lease);
        results
    }
}

/// Fan-out over the workers of `H`, correlated through a bridge's tables.
pub struct Fanout<H: EngineHost> {
    host: Arc<H>,
    pending: PendingCalls,
    callbacks: CallbackRegistry,
    timeout: Duration,
    sequence: AtomicU64,
}

impl<H: EngineHost> Fanout<H> {
    pub fn new(host: Arc<H>, bridge: &Bridge) -> Self {
        Self {
            host,
            pending: bridge.pending_calls(),
            callbacks: bridge.callbacks().clone(),
            timeout: bridge.config().call_timeout,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn deliver(&self, worker: WorkerHandle, envelope: &Envelope) -> Result<()> {
        let stamped = envelope.stamped(self.next_sequence(), worker.index);
        let bytes = bridgewire::encode(&stamped)?;
        self.host.send(worker, &bytes).await?;
        Ok(())
    }

    /// Sends a stamped copy of `envelope` to every live worker.
    pub async fn broadcast(&self, envelope: &Envelope) -> FanoutSummary {
        let workers = self.host.live_workers();
        let mut summary = FanoutSummary {
            total_workers: workers.len(),
            ..FanoutSummary::default()
        };

        for worker in workers {
            match self.deliver(worker, envelope).await {
                Ok(()) => summary.success_count += 1,
                Err(e) => {
                    warn!(worker = %worker.id, index = worker.index, error = %e, "failed to send to worker");
                    summary.error_count += 1;
                }
            }
        }

        debug!(cmd = %envelope.command(), ?summary, "broadcast finished");
        summary
    }

    /// Invokes `name` on every worker without waiting for replies.
    pub async fn invoke_all(&self, name: &str, args: Vec<Value>) -> FanoutSummary {
        self.broadcast(&Envelope::invoke(None, name, args)).await
    }

    /// Invokes `name` on every worker with a correlated call each.
    pub async fn call_all(&self, name: &str, args: Vec<CallArg>) -> FanoutCall {
        let (values, lease) = self.callbacks.marshal_args(args);
        self.correlated(Envelope::invoke(None, name, values), lease)
            .await
    }

    /// Pushes `data` to every worker and collects acknowledgements.
    pub async fn sync_all(&self, data: SyncData) -> FanoutCall {
        let (_, lease) = self.callbacks.marshal_args(Vec::new());
        self.correlated(Envelope::data_sync(None, data), lease)
            .await
    }

    async fn correlated(&self, template: Envelope, lease: Lease) -> FanoutCall {
        let workers = self.host.live_workers();
        let mut summary = FanoutSummary {
            total_workers: workers.len(),
            ..FanoutSummary::default()
        };
        let mut replies = Vec::with_capacity(workers.len());

        for worker in workers {
            let (id, reply) = match self.pending.register(self.timeout, None) {
                Ok(registered) => registered,
                Err(e) => {
                    warn!(worker = %worker.id, error = %e, "cannot register fan-out call");
                    summary.error_count += 1;
                    continue;
                }
            };

            let envelope = template.clone().with_correlation(id);
            match self.deliver(worker, &envelope).await {
                Ok(()) => {
                    summary.success_count += 1;
                    replies.push(WorkerReply { worker, reply });
                }
                Err(e) => {
                    self.pending.cancel(id);
                    warn!(worker = %worker.id, index = worker.index, id, error = %e, "failed to send to worker");
                    summary.error_count += 1;
                }
            }
        }

        debug!(cmd = %template.command(), ?summary, "correlated fan-out sent");
        FanoutCall {
            summary,
            replies,
            lease,
        }
    }
}
