//! # Capability Table
//!
//! Functions a context is willing to run on behalf of others, declared up
//! front as `name -> Handler`. Lookup of an unregistered name is a typed
//! `UnknownFunction`, never a lookup in some ambient namespace.
//!
//! Handlers receive `Args`: JSON values, plus `RemoteCallback`s where the
//! caller passed a function.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::bridge::Peer;
use crate::callback::CallArg;
use crate::error::Error;
use crate::error::Result;

/// What a handler returns: a value, or an error message for the caller.
pub type HandlerResult = std::result::Result<Value, String>;

/// A function callable through the bridge.
///
/// Any `Fn(Args) -> impl Future<Output = HandlerResult>` is a handler. Work
/// done before the returned future is first polled happens at dispatch time.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: Args) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Args) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(args))
    }
}

/// Starts `handler`, converting panics (at dispatch or while running) into
/// error results.
pub(crate) fn start(handler: &Arc<dyn Handler>, args: Args) -> BoxFuture<'static, HandlerResult> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(args))) {
        Ok(future) => AssertUnwindSafe(future)
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|payload| Err(panic_message(payload))))
            .boxed(),
        Err(payload) => futures::future::ready(Err(panic_message(payload))).boxed(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    };
    format!("handler panicked: {}", detail)
}

/// A function argument received from another context.
///
/// Invoking it sends a correlated call back over the link it arrived on.
#[derive(Clone)]
pub struct RemoteCallback {
    token: String,
    peer: Peer,
}

impl RemoteCallback {
    pub(crate) fn new(token: String, peer: Peer) -> Self {
        Self { token, peer }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let args = args.into_iter().map(CallArg::Value).collect();
        self.peer.call(&self.token, args).await
    }
}

impl std::fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallback")
            .field("token", &self.token)
            .field("link", &self.peer.link())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Arg {
    Value(Value),
    Callback(RemoteCallback),
}

/// Positional arguments handed to a handler.
#[derive(Clone, Debug, Default)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn new(args: Vec<Arg>) -> Self {
        Self(args)
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(Arg::Value).collect())
    }

    /// Rebuilds arguments received over `peer`, turning callback tokens into
    /// `RemoteCallback`s. Without a peer, tokens stay plain values.
    pub(crate) fn from_wire(values: Vec<Value>, peer: Option<&Peer>) -> Self {
        let args = values
            .into_iter()
            .map(|value| {
                match (bridgewire::callback_token(&value), peer) {
                    (Some(token), Some(peer)) => {
                        Arg::Callback(RemoteCallback::new(token.to_string(), peer.clone()))
                    }
                    _ => Arg::Value(value),
                }
            })
            .collect();
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }

    pub fn value(&self, index: usize) -> std::result::Result<&Value, String> {
        match self.0.get(index) {
            Some(Arg::Value(value)) => Ok(value),
            Some(Arg::Callback(_)) => Err(format!("argument {} is a callback, expected a value", index)),
            None => Err(format!("missing argument {}", index)),
        }
    }

    pub fn i64(&self, index: usize) -> std::result::Result<i64, String> {
        self.value(index)?
            .as_i64()
            .ok_or_else(|| format!("argument {} is not an integer", index))
    }

    pub fn f64(&self, index: usize) -> std::result::Result<f64, String> {
        self.value(index)?
            .as_f64()
            .ok_or_else(|| format!("argument {} is not a number", index))
    }

    pub fn str(&self, index: usize) -> std::result::Result<&str, String> {
        self.value(index)?
            .as_str()
            .ok_or_else(|| format!("argument {} is not a string", index))
    }

    pub fn callback(&self, index: usize) -> std::result::Result<RemoteCallback, String> {
        match self.0.get(index) {
            Some(Arg::Callback(callback)) => Ok(callback.clone()),
            Some(Arg::Value(_)) => Err(format!("argument {} is not a callback", index)),
            None => Err(format!("missing argument {}", index)),
        }
    }

    /// All arguments as plain values; fails if any is a callback.
    pub fn into_values(self) -> std::result::Result<Vec<Value>, String> {
        self.0
            .into_iter()
            .enumerate()
            .map(|(index, arg)| match arg {
                Arg::Value(value) => Ok(value),
                Arg::Callback(_) => Err(format!("argument {} is a callback, which this function cannot take", index)),
            })
            .collect()
    }
}

/// A statically declared mapping from function name to handler.
#[derive(Clone, Default)]
pub struct Capabilities {
    table: HashMap<String, Arc<dyn Handler>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler) {
        self.table.insert(name.into(), Arc::new(handler));
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.table.insert(name.into(), handler);
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.table
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
