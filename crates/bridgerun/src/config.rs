//! # Configuration
//!
//! Plain structs with defaults and consuming `with_*` setters.

use std::time::Duration;

/// Default wait for a correlated response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default wait for a module's readiness signal.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(15_000);
/// Default sampling period of the readiness poller.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-context bridge settings.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// How long a remote call waits for its response.
    pub call_timeout: Duration,
    /// Prefix of generated callback token names.
    pub callback_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            callback_prefix: "_onBridgeCall".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_callback_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.callback_prefix = prefix.into();
        self
    }
}

/// How to load and recognize a logic module.
#[derive(Clone, Debug)]
pub struct ModuleConfig {
    /// Asset id of the module binary. When data-sync triggers loading, this is
    /// also the key looked up in the synced asset table.
    pub module: String,
    /// Asset id of an optional runtime-loader binary, instantiated first and
    /// importable by the module as `runtime`.
    pub runtime: Option<String>,
    /// How long to wait for readiness after instantiation.
    pub timeout: Duration,
    /// Sampling period of the fallback poller.
    pub poll_interval: Duration,
    /// Naming convention the poller uses to recognize exported functions.
    pub export_prefix: String,
    /// Export run once after instantiation, if present.
    pub entry: Option<String>,
    /// Export called once after the module becomes ready, if present.
    pub init_export: Option<String>,
    /// Export that receives the `data` of each data sync, if present.
    pub data_export: Option<String>,
    /// How long one call into the module may run.
    pub call_timeout: Duration,
    /// Link WASI preview1 imports.
    pub wasi: bool,
}

impl ModuleConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            runtime: None,
            timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            export_prefix: "go".to_string(),
            entry: Some("_start".to_string()),
            init_export: None,
            data_export: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            wasi: true,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_export_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.export_prefix = prefix.into();
        self
    }

    pub fn with_entry(mut self, entry: Option<String>) -> Self {
        self.entry = entry;
        self
    }

    pub fn with_init_export(mut self, export: impl Into<String>) -> Self {
        self.init_export = Some(export.into());
        self
    }

    pub fn with_data_export(mut self, export: impl Into<String>) -> Self {
        self.data_export = Some(export.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_wasi(mut self, wasi: bool) -> Self {
        self.wasi = wasi;
        self
    }
}
