//! # Logic Module Host
//!
//! Compiles and instantiates the logic module (a WebAssembly core module)
//! with wasmtime, and exposes its exported functions as bridge handlers.
//!
//! ## Imports provided to the module
//!
//! - `bridge.ready(ptr: i32, len: i32)`: the explicit readiness signal. The
//!   module passes a JSON array of the function names it exports, located in
//!   its exported `memory`.
//! - `runtime.*`: every export of the runtime-loader module, when one is
//!   configured.
//! - `wasi_snapshot_preview1.*`: WASI preview1, unless disabled.
//!
//! ## Scheduling
//!
//! The engine runs with epoch interruption. A background thread advances the
//! epoch every `EPOCH_TICK`, and every store yields to the executor on each
//! tick, so a module stuck in a loop can still be timed out and cancelled.
//!
//! ## Values
//!
//! Exported functions take and return core numeric types. JSON numbers are
//! converted by parameter type; a single result becomes a JSON value, several
//! become an array, none becomes `null`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use wasmtime::Caller;
use wasmtime::Engine;
use wasmtime::Extern;
use wasmtime::ExternType;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::Val;
use wasmtime::ValType;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::capability::Args;
use crate::capability::Handler;
use crate::capability::HandlerResult;
use crate::config::ModuleConfig;
use crate::error::Error;
use crate::error::Result;
use crate::gate::Completion;

/// Import module name of the readiness signal.
pub const BRIDGE_IMPORT: &str = "bridge";
/// Import module name under which the runtime loader's exports are linked.
pub const RUNTIME_IMPORT: &str = "runtime";

const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-store host state.
pub(crate) struct HostState {
    wasi: WasiP1Ctx,
    ready: Completion,
}

/// Compiles and links logic modules. Holds the wasmtime engine.
#[derive(Clone)]
pub struct ModuleHost {
    engine: Engine,
}

impl ModuleHost {
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config).map_err(|e| Error::Instantiation(e.to_string()))?;
        spawn_epoch_ticker(&engine)?;
        Ok(Self { engine })
    }

    /// Links and instantiates `module_bytes` (after `runtime_bytes`, if any).
    ///
    /// Readiness signals raised by the module are delivered to `ready`.
    pub(crate) async fn instantiate(
        &self,
        config: &ModuleConfig,
        module_bytes: &[u8],
        runtime_bytes: Option<&[u8]>,
        ready: Completion,
    ) -> Result<LoadedModule> {
        let mut linker: Linker<HostState> = Linker::new(&self.engine);

        if config.wasi {
            wasmtime_wasi::p1::add_to_linker_async(&mut linker, |state: &mut HostState| &mut state.wasi)
                .map_err(link_error)?;
        }

        linker
            .func_wrap(
                BRIDGE_IMPORT,
                "ready",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    let names = read_ready_names(&mut caller, ptr, len)?;
                    debug!(?names, "module raised readiness signal");
                    caller.data().ready.complete(Ok(names));
                    Ok(())
                },
            )
            .map_err(link_error)?;

        let wasi = WasiCtxBuilder::new().inherit_stdio().build_p1();
        let mut store = Store::new(&self.engine, HostState { wasi, ready });
        store.epoch_deadline_async_yield_and_update(1);

        if let Some(bytes) = runtime_bytes {
            let runtime = Module::new(&self.engine, bytes)
                .map_err(|e| Error::Instantiation(format!("runtime loader: {}", e)))?;
            let instance = linker
                .instantiate_async(&mut store, &runtime)
                .await
                .map_err(|e| Error::Instantiation(format!("runtime loader: {}", e)))?;
            linker
                .instance(&mut store, RUNTIME_IMPORT, instance)
                .map_err(link_error)?;
        }

        let module = Module::new(&self.engine, module_bytes)
            .map_err(|e| Error::Instantiation(e.to_string()))?;
        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| Error::Instantiation(e.to_string()))?;

        let functions = module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect();

        Ok(LoadedModule {
            store: Mutex::new(store),
            instance,
            functions,
        })
    }
}

/// Advances the engine's epoch until every handle to the engine is gone.
fn spawn_epoch_ticker(engine: &Engine) -> Result<()> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("bridge-epoch".into())
        .spawn(move || {
            while let Some(engine) = weak.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(EPOCH_TICK);
            }
        })
        .map_err(|e| Error::Instantiation(format!("epoch ticker: {}", e)))?;
    Ok(())
}

fn link_error(e: wasmtime::Error) -> Error {
    Error::Instantiation(format!("linker: {}", e))
}

fn read_ready_names(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<String>> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("ready signal requires an exported memory"))?;

    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or_else(|| wasmtime::Error::msg("ready signal range overflows"))?;
    let bytes = memory
        .data(&*caller)
        .get(start..end)
        .ok_or_else(|| wasmtime::Error::msg("ready signal range is out of bounds"))?;

    serde_json::from_slice(bytes)
        .map_err(|e| wasmtime::Error::msg(format!("ready signal is not a JSON list of names: {}", e)))
}

/// An instantiated logic module.
///
/// The store is behind an async mutex: calls into the module run one at a
/// time, in the order they acquire it.
pub struct LoadedModule {
    store: Mutex<Store<HostState>>,
    instance: Instance,
    functions: Vec<String>,
}

impl LoadedModule {
    /// Names of all exported functions.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Exported functions following the naming convention `prefix*`.
    pub fn functions_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.functions
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }

    /// Runs a parameterless entry export. A WASI `proc_exit(0)` counts as a
    /// clean return.
    pub async fn run_entry(&self, name: &str) -> std::result::Result<(), String> {
        let mut store = self.store.lock().await;
        let func = self
            .instance
            .get_func(&mut *store, name)
            .ok_or_else(|| format!("module exports no function '{}'", name))?;

        match func.call_async(&mut *store, &[], &mut []).await {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) if exit.0 == 0 => Ok(()),
                _ => Err(format!("entry '{}' trapped: {}", name, e)),
            },
        }
    }

    /// Calls an exported function with JSON arguments.
    pub async fn call(&self, name: &str, args: &[Value]) -> std::result::Result<Value, String> {
        let mut store = self.store.lock().await;
        let func = self
            .instance
            .get_func(&mut *store, name)
            .ok_or_else(|| format!("module exports no function '{}'", name))?;
        let ty = func.ty(&*store);

        if ty.params().len() != args.len() {
            return Err(format!(
                "'{}' expects {} arguments, got {}",
                name,
                ty.params().len(),
                args.len()
            ));
        }

        let params = ty
            .params()
            .zip(args)
            .enumerate()
            .map(|(index, (param, arg))| {
                to_val(&param, arg).ok_or_else(|| {
                    format!("argument {} of '{}' cannot be converted to {}", index, name, param)
                })
            })
            .collect::<std::result::Result<Vec<Val>, String>>()?;

        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call_async(&mut *store, &params, &mut results)
            .await
            .map_err(|e| format!("'{}' trapped: {}", name, e))?;

        Ok(match results.as_slice() {
            [] => Value::Null,
            [single] => from_val(single),
            many => Value::Array(many.iter().map(from_val).collect()),
        })
    }
}

fn to_val(ty: &ValType, value: &Value) -> Option<Val> {
    match ty {
        ValType::I32 => match value {
            Value::Bool(b) => Some(Val::I32(i32::from(*b))),
            _ => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Val::I32),
        },
        ValType::I64 => match value {
            Value::Bool(b) => Some(Val::I64(i64::from(*b))),
            _ => value.as_i64().map(Val::I64),
        },
        ValType::F32 => value.as_f64().map(|f| Val::F32((f as f32).to_bits())),
        ValType::F64 => value.as_f64().map(|f| Val::F64(f.to_bits())),
        _ => None,
    }
}

fn from_val(val: &Val) -> Value {
    match val {
        Val::I32(n) => Value::from(*n),
        Val::I64(n) => Value::from(*n),
        Val::F32(bits) => float_value(f32::from_bits(*bits) as f64),
        Val::F64(bits) => float_value(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// One exported function of a loaded module, as a bridge handler.
pub struct ModuleExport {
    module: Arc<LoadedModule>,
    name: String,
}

impl ModuleExport {
    pub fn new(module: Arc<LoadedModule>, name: impl Into<String>) -> Self {
        Self {
            module,
            name: name.into(),
        }
    }
}

impl Handler for ModuleExport {
    fn call(&self, args: Args) -> BoxFuture<'static, HandlerResult> {
        let module = self.module.clone();
        let name = self.name.clone();
        Box::pin(async move {
            let values = args.into_values()?;
            module.call(&name, &values).await
        })
    }
}
