//! # Module Readiness Gate
//!
//! Hides the asynchronous, multi-phase startup of a logic module behind a
//! single state machine, so callers can issue calls before the module is
//! usable.
//!
//! ```text
//! Uninitialized -> Loading -> WaitingReady -> Ready
//!                     |            |
//!                     +------------+--> Failed --(initialize)--> Loading
//!
//! any state --(destroy)--> Destroyed
//! ```
//!
//! Readiness has two sources that feed one `Completion`: the module's own
//! `bridge.ready` signal, and a poller that samples the module's exports for
//! the configured naming convention. Whichever fires first wins.
//!
//! Calls issued before `Ready` are queued. On `Ready` the queue is drained in
//! FIFO order, and calls issued while the drain is still running join the
//! back of the queue, so nothing overtakes a call that was queued earlier.
//! A queued call whose caller has gone away is skipped.
//!
//! Every call into the module, queued or direct, is bounded by the
//! configured `call_timeout`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::asset::AssetSource;
use crate::capability;
use crate::capability::Args;
use crate::capability::Capabilities;
use crate::config::DEFAULT_CALL_TIMEOUT;
use crate::config::ModuleConfig;
use crate::error::Error;
use crate::error::Result;
use crate::module::LoadedModule;
use crate::module::ModuleExport;
use crate::module::ModuleHost;
use crate::status::Status;
use crate::status::StatusSink;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Uninitialized,
    Loading,
    WaitingReady,
    Ready,
    Failed { reason: String },
    Destroyed,
}

impl ModuleState {
    /// Whether calls issued in this state are queued.
    pub fn accepts_queued_calls(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Loading | Self::WaitingReady)
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed { .. } | Self::Destroyed)
    }
}

type ReadySender = oneshot::Sender<Result<Vec<String>>>;

/// One-shot readiness outcome shared by every detection path.
///
/// The first `complete` wins; later ones are ignored.
#[derive(Clone)]
pub struct Completion {
    tx: Arc<Mutex<Option<ReadySender>>>,
}

impl Completion {
    pub fn new() -> (Self, oneshot::Receiver<Result<Vec<String>>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    /// Delivers `outcome` if nothing has been delivered yet. Returns whether
    /// this call was the one that completed it.
    pub fn complete(&self, outcome: Result<Vec<String>>) -> bool {
        let taken = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

struct Queued {
    name: String,
    args: Args,
    tx: oneshot::Sender<Result<Value>>,
}

struct GateState {
    state: ModuleState,
    queue: VecDeque<Queued>,
    draining: bool,
    exports: Capabilities,
    module: Option<Arc<LoadedModule>>,
    failure: Option<Error>,
    call_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    host: ModuleHost,
    assets: Arc<dyn AssetSource>,
    status: Arc<dyn StatusSink>,
    state: Mutex<GateState>,
    watch: watch::Sender<ModuleState>,
}

/// Readiness gate around one hosted logic module. Cheap to clone.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<Inner>,
}

enum Begin {
    Start,
    Await(watch::Receiver<ModuleState>),
    Done(Vec<String>),
}

enum Next {
    Run(futures::future::BoxFuture<'static, capability::HandlerResult>, Duration),
    Wait(oneshot::Receiver<Result<Value>>),
}

impl Gate {
    pub fn new(assets: Arc<dyn AssetSource>, status: Arc<dyn StatusSink>) -> Result<Self> {
        Ok(Self::with_host(ModuleHost::new()?, assets, status))
    }

    pub fn with_host(host: ModuleHost, assets: Arc<dyn AssetSource>, status: Arc<dyn StatusSink>) -> Self {
        let (watch, _) = watch::channel(ModuleState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                host,
                assets,
                status,
                state: Mutex::new(GateState {
                    state: ModuleState::Uninitialized,
                    queue: VecDeque::new(),
                    draining: false,
                    exports: Capabilities::new(),
                    module: None,
                    failure: None,
                    call_timeout: DEFAULT_CALL_TIMEOUT,
                    tasks: Vec::new(),
                }),
                watch,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, st: &mut GateState, state: ModuleState) {
        debug!(from = ?st.state, to = ?state, "gate transition");
        st.state = state.clone();
        self.inner.watch.send_replace(state);
    }

    pub fn state(&self) -> ModuleState {
        self.inner.watch.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModuleState> {
        self.inner.watch.subscribe()
    }

    /// Names of the functions published on `Ready`.
    pub fn exports(&self) -> Vec<String> {
        self.lock().exports.names()
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.lock().exports.contains(name)
    }

    /// Number of calls waiting for the module.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Loads the module described by `config` and waits for readiness.
    ///
    /// Returns the published function names. While another initialization
    /// is in flight this awaits its outcome instead of loading again; once
    /// `Ready` it returns immediately.
    pub async fn initialize(&self, config: ModuleConfig) -> Result<Vec<String>> {
        let begin = {
            let mut st = self.lock();
            let state = st.state.clone();
            match state {
                ModuleState::Ready => Begin::Done(st.exports.names()),
                ModuleState::Loading | ModuleState::WaitingReady => Begin::Await(self.subscribe()),
                ModuleState::Destroyed => return Err(Error::BridgeDestroyed),
                ModuleState::Uninitialized | ModuleState::Failed { .. } => {
                    st.failure = None;
                    st.call_timeout = config.call_timeout;
                    self.transition(&mut st, ModuleState::Loading);
                    Begin::Start
                }
            }
        };

        match begin {
            Begin::Done(names) => Ok(names),
            Begin::Await(rx) => self.await_outcome(rx).await,
            Begin::Start => {
                info!(module = %config.module, "loading logic module");
                self.inner.status.emit(Status::Loading);
                match self.load(&config).await {
                    Ok(names) => {
                        self.run_init_export(&config).await;
                        Ok(names)
                    }
                    Err(e) => {
                        self.fail(e.clone());
                        Err(e)
                    }
                }
            }
        }
    }

    /// Waits until the gate settles into `Ready`, `Failed` or `Destroyed`.
    pub async fn wait_ready(&self) -> Result<Vec<String>> {
        self.await_outcome(self.subscribe()).await
    }

    async fn await_outcome(&self, mut rx: watch::Receiver<ModuleState>) -> Result<Vec<String>> {
        let settled = match rx.wait_for(ModuleState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => ModuleState::Destroyed,
        };

        let st = self.lock();
        match settled {
            ModuleState::Ready => Ok(st.exports.names()),
            ModuleState::Failed { reason } => Err(st.failure.clone().unwrap_or(Error::ModuleFailed(reason))),
            _ => Err(Error::BridgeDestroyed),
        }
    }

    async fn load(&self, config: &ModuleConfig) -> Result<Vec<String>> {
        let runtime = match &config.runtime {
            Some(asset) => Some(self.inner.assets.fetch_bytes(asset).await?),
            None => None,
        };
        let bytes = self.inner.assets.fetch_bytes(&config.module).await?;

        let (completion, ready) = Completion::new();
        let module = self
            .inner
            .host
            .instantiate(config, &bytes, runtime.as_deref(), completion.clone())
            .await?;
        let module = Arc::new(module);

        {
            let mut st = self.lock();
            if st.state == ModuleState::Destroyed {
                return Err(Error::BridgeDestroyed);
            }
            self.transition(&mut st, ModuleState::WaitingReady);
        }
        debug!(functions = ?module.functions(), "module instantiated, waiting for readiness");

        let entry_done = Arc::new(AtomicBool::new(false));
        let entry = spawn_entry(module.clone(), config.entry.clone(), completion.clone(), entry_done.clone());
        let poller = spawn_poller(module.clone(), config.clone(), completion, entry_done);
        self.lock().tasks.push(entry);

        let outcome = tokio::time::timeout(config.timeout, ready).await;
        poller.abort();

        let names = match outcome {
            Ok(Ok(Ok(names))) => names,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(Error::Instantiation("module dropped before signalling readiness".into())),
            Err(_) => {
                warn!(timeout_ms = config.timeout.as_millis() as u64, "module did not signal readiness");
                return Err(Error::ReadinessTimeout);
            }
        };

        self.become_ready(module, names)
    }

    fn become_ready(&self, module: Arc<LoadedModule>, names: Vec<String>) -> Result<Vec<String>> {
        let mut exports = Capabilities::new();
        for name in names {
            if module.has_function(&name) {
                exports.insert(name.clone(), Arc::new(ModuleExport::new(module.clone(), name)));
            } else {
                warn!(function = %name, "module announced a function it does not export");
            }
        }
        let published = exports.names();

        let drain = {
            let mut st = self.lock();
            if st.state == ModuleState::Destroyed {
                return Err(Error::BridgeDestroyed);
            }
            st.exports = exports;
            st.module = Some(module);
            st.draining = !st.queue.is_empty();
            self.transition(&mut st, ModuleState::Ready);
            st.draining
        };

        info!(functions = ?published, "logic module ready");
        self.inner.status.emit(Status::Ready {
            functions: published.clone(),
        });

        if drain {
            let gate = self.clone();
            let task = tokio::spawn(async move { gate.drain().await });
            self.lock().tasks.push(task);
        }

        Ok(published)
    }

    async fn drain(&self) {
        loop {
            let next = {
                let mut st = self.lock();
                if st.state != ModuleState::Ready {
                    return;
                }
                match st.queue.pop_front() {
                    Some(queued) => {
                        let handler = st.exports.lookup(&queued.name);
                        (queued, handler, st.call_timeout)
                    }
                    None => {
                        st.draining = false;
                        return;
                    }
                }
            };

            let (queued, handler, timeout) = next;
            if queued.tx.is_closed() {
                debug!(function = %queued.name, "skipping queued call abandoned by its caller");
                continue;
            }
            debug!(function = %queued.name, "dispatching queued call");
            let outcome = match handler {
                Ok(handler) => run_bounded(capability::start(&handler, queued.args), timeout).await,
                Err(e) => Err(e),
            };
            let _ = queued.tx.send(outcome);
        }
    }

    /// Calls the configured init export once. Its failure is logged only.
    async fn run_init_export(&self, config: &ModuleConfig) {
        let Some(name) = &config.init_export else { return };
        if !self.is_exported(name) {
            debug!(function = %name, "module has no init export");
            return;
        }

        match self.call(name, Args::default()).await {
            Ok(_) => debug!(function = %name, "init export completed"),
            Err(e) => warn!(function = %name, error = %e, "init export failed"),
        }
    }

    fn fail(&self, error: Error) {
        let (queued, tasks) = {
            let mut st = self.lock();
            if st.state == ModuleState::Destroyed {
                return;
            }
            st.failure = Some(error.clone());
            st.module = None;
            st.exports = Capabilities::new();
            st.draining = false;
            self.transition(&mut st, ModuleState::Failed {
                reason: error.to_string(),
            });
            (std::mem::take(&mut st.queue), std::mem::take(&mut st.tasks))
        };

        for task in tasks {
            task.abort();
        }
        warn!(error = %error, rejected = queued.len(), "logic module failed to initialize");
        for call in queued {
            let _ = call.tx.send(Err(error.clone()));
        }
        self.inner.status.emit(Status::Failed {
            reason: error.to_string(),
        });
    }

    /// Calls a function of the hosted module, queueing it until `Ready`.
    pub async fn call(&self, name: &str, args: Args) -> Result<Value> {
        let next = {
            let mut st = self.lock();
            let state = st.state.clone();
            match state {
                ModuleState::Ready if !st.draining => {
                    let handler = st.exports.lookup(name)?;
                    Next::Run(capability::start(&handler, args), st.call_timeout)
                }
                ModuleState::Ready
                | ModuleState::Uninitialized
                | ModuleState::Loading
                | ModuleState::WaitingReady => {
                    let (tx, rx) = oneshot::channel();
                    st.queue.push_back(Queued {
                        name: name.to_string(),
                        args,
                        tx,
                    });
                    debug!(function = %name, queued = st.queue.len(), "call queued until module is ready");
                    Next::Wait(rx)
                }
                ModuleState::Failed { reason } => {
                    let reason = st.failure.as_ref().map(Error::to_string).unwrap_or(reason);
                    return Err(Error::ModuleFailed(reason));
                }
                ModuleState::Destroyed => return Err(Error::BridgeDestroyed),
            }
        };

        match next {
            Next::Run(future, timeout) => run_bounded(future, timeout).await,
            Next::Wait(rx) => rx.await.unwrap_or(Err(Error::BridgeDestroyed)),
        }
    }

    /// Issues several calls at once. Outcomes are returned in call order; one
    /// failing call does not affect the others.
    pub async fn call_many(&self, calls: Vec<(String, Args)>) -> Vec<Result<Value>> {
        let calls = calls
            .into_iter()
            .map(|(name, args)| async move { self.call(&name, args).await });
        futures::future::join_all(calls).await
    }

    /// Moves to `Destroyed`, rejecting queued calls with `BridgeDestroyed`.
    pub fn destroy(&self) {
        let (queued, tasks) = {
            let mut st = self.lock();
            if st.state == ModuleState::Destroyed {
                return;
            }
            st.module = None;
            st.exports = Capabilities::new();
            st.draining = false;
            self.transition(&mut st, ModuleState::Destroyed);
            (std::mem::take(&mut st.queue), std::mem::take(&mut st.tasks))
        };

        for task in tasks {
            task.abort();
        }
        debug!(rejected = queued.len(), "gate destroyed");
        for call in queued {
            let _ = call.tx.send(Err(Error::BridgeDestroyed));
        }
    }
}

async fn run_bounded(
    call: futures::future::BoxFuture<'static, capability::HandlerResult>,
    timeout: Duration,
) -> Result<Value> {
    match tokio::time::timeout(timeout, call).await {
        Ok(outcome) => outcome.map_err(Error::Remote),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "module call timed out");
            Err(Error::CallTimeout)
        }
    }
}

fn spawn_entry(
    module: Arc<LoadedModule>,
    entry: Option<String>,
    completion: Completion,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let entry = entry.filter(|name| module.has_function(name));
        if let Some(name) = entry {
            if let Err(e) = module.run_entry(&name).await {
                if !completion.complete(Err(Error::Instantiation(e.clone()))) {
                    warn!(error = %e, "module entry failed after readiness");
                }
                return;
            }
            debug!(entry = %name, "module entry returned");
        }
        done.store(true, Ordering::SeqCst);
    })
}

fn spawn_poller(
    module: Arc<LoadedModule>,
    config: ModuleConfig,
    completion: Completion,
    entry_done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.poll_interval);
        loop {
            interval.tick().await;
            if completion.is_done() {
                return;
            }
            if !entry_done.load(Ordering::SeqCst) {
                continue;
            }
            let found = module.functions_with_prefix(&config.export_prefix);
            if !found.is_empty() {
                debug!(functions = ?found, "readiness detected by polling");
                completion.complete(Ok(found));
                return;
            }
        }
    })
}
