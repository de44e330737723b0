//! # Bridge and Peer Links
//!
//! A `Bridge` is one execution context's endpoint: it owns the pending-call
//! table, the callback registry, the capability table, the data store and,
//! if the context hosts the logic module, its readiness gate.
//!
//! Every transport attached to a bridge becomes a `Peer` link. Attaching
//! spawns a pump task that reads envelopes from the transport and hands them
//! to the router; outgoing calls go through `Peer::call`.
//!
//! Nothing here is global. Two bridges in one process share no state, which
//! is how tests run several "contexts" side by side.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridgewire::CorrelationId;
use bridgewire::Envelope;
use bridgewire::Outcome;
use bridgewire::SyncData;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::asset::AssetSource;
use crate::callback::CallArg;
use crate::callback::CallbackRegistry;
use crate::capability;
use crate::capability::Args;
use crate::capability::Capabilities;
use crate::capability::Handler;
use crate::config::BridgeConfig;
use crate::config::ModuleConfig;
use crate::error::Error;
use crate::error::Result;
use crate::gate::Gate;
use crate::pending::PendingCalls;
use crate::router;
use crate::status::NullSink;
use crate::status::StatusSink;
use crate::store::DataStore;
use crate::transport;
use crate::transport::Transport;

/// Strong type for link identifiers, unique within one bridge.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

pub(crate) struct Hosting {
    pub(crate) gate: Gate,
    pub(crate) template: ModuleConfig,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) config: BridgeConfig,
    pub(crate) pending: PendingCalls,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) capabilities: Capabilities,
    pub(crate) hosting: Option<Hosting>,
    pub(crate) store: DataStore,
    pub(crate) passthrough: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pumps: DashMap<LinkId, JoinHandle<()>>,
    next_link: AtomicU64,
    destroyed: AtomicBool,
}

impl Shared {
    /// Resolves `name` against callback tokens, then registered capabilities,
    /// then the hosted module, and runs it.
    pub(crate) async fn dispatch(&self, name: &str, args: Args) -> Result<Value> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::BridgeDestroyed);
        }

        if let Some(handler) = self.callbacks.lookup(name) {
            return capability::start(&handler, args).await.map_err(Error::Remote);
        }

        if let Ok(handler) = self.capabilities.lookup(name) {
            return capability::start(&handler, args).await.map_err(Error::Remote);
        }

        match &self.hosting {
            Some(hosting) => hosting.gate.call(name, args).await,
            None => Err(Error::UnknownFunction(name.to_string())),
        }
    }
}

/// Fluent builder for a `Bridge`.
pub struct BridgeBuilder {
    name: String,
    config: BridgeConfig,
    capabilities: Capabilities,
    module: Option<(ModuleConfig, Arc<dyn AssetSource>)>,
    status: Arc<dyn StatusSink>,
    passthrough: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl BridgeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BridgeConfig::default(),
            capabilities: Capabilities::new(),
            module: None,
            status: Arc::new(NullSink),
            passthrough: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Exposes `handler` to other contexts under `name`.
    pub fn capability(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.capabilities.register(name, handler);
        self
    }

    pub fn capabilities(mut self, f: impl FnOnce(&mut Capabilities)) -> Self {
        f(&mut self.capabilities);
        self
    }

    /// Makes this context host the logic module described by `template`,
    /// fetched from `assets`.
    pub fn host_module(mut self, template: ModuleConfig, assets: impl AssetSource) -> Self {
        self.module = Some((template, Arc::new(assets)));
        self
    }

    pub fn status(mut self, sink: impl StatusSink) -> Self {
        self.status = Arc::new(sink);
        self
    }

    /// Forwards raw messages with commands the bridge does not speak.
    pub fn passthrough(mut self, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        self.passthrough = Some(tx);
        self
    }

    pub fn build(self) -> Result<Bridge> {
        let hosting = match self.module {
            Some((template, assets)) => Some(Hosting {
                gate: Gate::new(assets, self.status)?,
                template,
            }),
            None => None,
        };

        let callbacks = CallbackRegistry::new(self.name.clone(), self.config.callback_prefix.clone());
        debug!(bridge = %self.name, capabilities = ?self.capabilities.names(), hosts_module = hosting.is_some(), "bridge built");

        Ok(Bridge {
            shared: Arc::new(Shared {
                name: self.name,
                config: self.config,
                pending: PendingCalls::new(),
                callbacks,
                capabilities: self.capabilities,
                hosting,
                store: DataStore::new(),
                passthrough: self.passthrough,
                pumps: DashMap::new(),
                next_link: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

/// One execution context's end of the bridge. Cheap to clone.
///
/// Pump tasks keep the bridge alive while their transport is open; call
/// `destroy` to tear it down.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    pub fn builder(name: impl Into<String>) -> BridgeBuilder {
        BridgeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Connects a transport to this context and starts reading from it.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Peer {
        let link = LinkId(self.shared.next_link.fetch_add(1, Ordering::Relaxed));
        let peer = Peer {
            shared: self.shared.clone(),
            link,
            transport,
        };

        let pump = peer.clone();
        let (registered, wait_registered) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // The entry in `pumps` must exist before this task can remove it.
            let _ = wait_registered.await;
            let error = loop {
                match pump.transport.recv().await {
                    Ok(Some(msg)) => router::route(&pump, msg),
                    Ok(None) => break transport::Error::ConnectionLost("stream closed".into()),
                    Err(e) => break e,
                }
            };

            pump.shared.pumps.remove(&pump.link);
            let rejected = pump.shared.pending.fail_link(pump.link, Error::Transport(error.clone()));
            debug!(bridge = %pump.shared.name, link = %pump.link, rejected, error = %error, "link pump stopped");
        });

        self.shared.pumps.insert(link, task);
        let _ = registered.send(());
        debug!(bridge = %self.shared.name, link = %link, "transport attached");
        peer
    }

    /// The readiness gate, if this context hosts the module.
    pub fn gate(&self) -> Option<&Gate> {
        self.shared.hosting.as_ref().map(|hosting| &hosting.gate)
    }

    /// Initializes the hosted module from the configured template.
    pub async fn initialize(&self) -> Result<Vec<String>> {
        let hosting = self
            .shared
            .hosting
            .as_ref()
            .ok_or_else(|| Error::Instantiation(format!("context '{}' hosts no module", self.shared.name)))?;
        hosting.gate.initialize(hosting.template.clone()).await
    }

    /// Runs `name` in this context, resolved the same way as an inbound
    /// invocation.
    pub async fn call_local(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.shared.dispatch(name, Args::from_values(args)).await
    }

    /// The data most recently pushed by `dataSync`.
    pub fn data(&self) -> SyncData {
        self.shared.store.snapshot()
    }

    pub fn data_version(&self) -> u64 {
        self.shared.store.version()
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.shared.pending
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.shared.callbacks
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.capabilities
    }

    /// Number of links whose pump is still running.
    pub fn links(&self) -> usize {
        self.shared.pumps.len()
    }

    /// Tears the context down: outstanding calls and queued module calls are
    /// rejected with `BridgeDestroyed`, callback tokens are revoked and pumps
    /// are stopped. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let rejected = self.shared.pending.teardown();
        if let Some(gate) = self.gate() {
            gate.destroy();
        }
        let revoked = self.shared.callbacks.clear();

        let links: Vec<LinkId> = self.shared.pumps.iter().map(|entry| *entry.key()).collect();
        for link in links {
            if let Some((_, task)) = self.shared.pumps.remove(&link) {
                task.abort();
            }
        }

        info!(bridge = %self.shared.name, rejected, revoked, "bridge destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_calls(&self) -> PendingCalls {
        self.shared.pending.clone()
    }
}

/// A link from this context to one other context.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
    link: LinkId,
    transport: Arc<dyn Transport>,
}

impl Peer {
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Name of the context this link belongs to.
    pub fn owner(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Whether this link's pump is still reading from the transport.
    pub fn is_alive(&self) -> bool {
        self.shared.pumps.contains_key(&self.link)
    }

    /// Calls `name` on the other context and waits for its response, using
    /// the bridge's call timeout.
    pub async fn call(&self, name: &str, args: Vec<CallArg>) -> Result<Value> {
        self.call_with_timeout(name, args, self.shared.config.call_timeout)
            .await
    }

    /// Like `call`, with an explicit timeout.
    ///
    /// Functions passed as `CallArg::Func` are callable by the other side
    /// until this call settles.
    pub async fn call_with_timeout(&self, name: &str, args: Vec<CallArg>, timeout: Duration) -> Result<Value> {
        let (values, lease) = self.shared.callbacks.marshal_args(args);
        let (id, reply) = self.shared.pending.register(timeout, Some(self.link))?;
        // The pump leaves `pumps` before failing its link's calls, so a call
        // registered while the pump is still listed is rejected by it.
        if !self.is_alive() {
            self.shared.pending.cancel(id);
            return Err(Error::Transport(transport::Error::ConnectionLost(format!("{} is closed", self.link))));
        }

        let envelope = Envelope::invoke(Some(id), name, values);
        self.send_registered(id, &envelope).await?;

        let outcome = reply.await;
        drop(lease);
        outcome
    }

    /// Invokes `name` without waiting for (or receiving) a response.
    /// Function arguments stay registered.
    pub async fn notify(&self, name: &str, args: Vec<CallArg>) -> Result<()> {
        let values = self.shared.callbacks.marshal_durable(args);
        self.send(&Envelope::invoke(None, name, values)).await
    }

    /// Pushes `data` and waits for the other context to acknowledge it.
    pub async fn sync(&self, data: SyncData) -> Result<()> {
        let (id, reply) = self
            .shared
            .pending
            .register(self.shared.config.call_timeout, Some(self.link))?;
        self.send_registered(id, &Envelope::data_sync(Some(id), data))
            .await?;
        reply.await.map(|_| ())
    }

    /// Pushes `data` without an acknowledgement.
    pub async fn push(&self, data: SyncData) -> Result<()> {
        self.send(&Envelope::data_sync(None, data)).await
    }

    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = bridgewire::encode(envelope)?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    /// Sends an envelope whose correlation id is already registered; the
    /// entry is cancelled if the send fails.
    async fn send_registered(&self, id: CorrelationId, envelope: &Envelope) -> Result<()> {
        if let Err(e) = self.send(envelope).await {
            self.shared.pending.cancel(id);
            warn!(bridge = %self.shared.name, link = %self.link, id, error = %e, "failed to send call");
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn respond(&self, id: CorrelationId, outcome: Outcome) {
        if let Err(e) = self.send(&Envelope::response(id, outcome)).await {
            warn!(bridge = %self.shared.name, link = %self.link, id, error = %e, "failed to send response");
        }
    }
}
