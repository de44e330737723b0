//! # Callback Proxy Registry
//!
//! Lets a function value "travel" across a channel that only carries data.
//!
//! `marshal` stores the function under a fresh token name and hands back the
//! token, which crosses the channel in place of the function. When the other
//! side invokes that name, the router finds the function here and runs it as
//! a trampoline, answering with a `response` envelope.
//!
//! Tokens are capabilities: whoever holds the name may call it. To bound their
//! lifetime, tokens marshaled for a call are leased to it: the returned
//! `Lease` revokes them when dropped, which the peer does once the call has
//! settled. Functions passed as `CallArg::Durable` are not leased and live
//! until revoked or until bridge teardown.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use crate::capability::Args;
use crate::capability::Handler;
use crate::capability::HandlerResult;

/// An outgoing call argument.
#[derive(Clone)]
pub enum CallArg {
    Value(Value),
    /// A function leased to the call it is passed to.
    Func(Arc<dyn Handler>),
    /// A function that stays callable after the call settles.
    Durable(Arc<dyn Handler>),
}

impl CallArg {
    pub fn func<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Func(Arc::new(f))
    }

    pub fn durable<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Durable(Arc::new(f))
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// The name standing in for a marshaled function, and the context owning it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackToken {
    pub name: String,
    pub owner: String,
}

struct Entry {
    handler: Arc<dyn Handler>,
    durable: bool,
}

struct Inner {
    owner: String,
    prefix: String,
    counter: AtomicU64,
    entries: DashMap<String, Entry>,
}

/// Marshaled functions of one context. Cheap to clone.
#[derive(Clone)]
pub struct CallbackRegistry {
    inner: Arc<Inner>,
}

impl CallbackRegistry {
    pub fn new(owner: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: owner.into(),
                prefix: prefix.into(),
                counter: AtomicU64::new(0),
                entries: DashMap::new(),
            }),
        }
    }

    /// Installs `handler` under a fresh token.
    ///
    /// Names combine wall-clock time with a registry-wide counter, so a burst
    /// of marshals within one millisecond still yields distinct tokens.
    pub fn marshal(&self, handler: Arc<dyn Handler>, durable: bool) -> CallbackToken {
        let count = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}_{}", self.inner.prefix, bridgewire::now_millis(), count);
        self.inner.entries.insert(name.clone(), Entry { handler, durable });
        trace!(token = %name, durable, "marshaled callback");

        CallbackToken {
            name,
            owner: self.inner.owner.clone(),
        }
    }

    /// Replaces function arguments with tokens. Non-durable tokens are
    /// revoked when the returned lease is dropped.
    pub fn marshal_args(&self, args: Vec<CallArg>) -> (Vec<Value>, Lease) {
        let mut lease = Lease {
            registry: Arc::downgrade(&self.inner),
            tokens: Vec::new(),
        };

        let values = args
            .into_iter()
            .map(|arg| match arg {
                CallArg::Value(value) => value,
                CallArg::Func(handler) => {
                    let token = self.marshal(handler, false);
                    let value = bridgewire::callback_value(&token.name);
                    lease.tokens.push(token.name);
                    value
                }
                CallArg::Durable(handler) => {
                    let token = self.marshal(handler, true);
                    bridgewire::callback_value(&token.name)
                }
            })
            .collect();

        (values, lease)
    }

    /// Like `marshal_args`, but every function stays registered.
    pub fn marshal_durable(&self, args: Vec<CallArg>) -> Vec<Value> {
        let promoted = args
            .into_iter()
            .map(|arg| match arg {
                CallArg::Func(handler) => CallArg::Durable(handler),
                other => other,
            })
            .collect();
        let (values, _lease) = self.marshal_args(promoted);
        values
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.inner.entries.get(name).map(|entry| entry.handler.clone())
    }

    pub fn is_durable(&self, name: &str) -> Option<bool> {
        self.inner.entries.get(name).map(|entry| entry.durable)
    }

    pub fn revoke(&self, name: &str) -> bool {
        self.inner.entries.remove(name).is_some()
    }

    /// Revokes every token. Returns how many there were.
    pub fn clear(&self) -> usize {
        let count = self.inner.entries.len();
        self.inner.entries.clear();
        debug!(owner = %self.inner.owner, count, "callback registry cleared");
        count
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

/// Revokes the tokens it holds when dropped.
pub struct Lease {
    registry: Weak<Inner>,
    tokens: Vec<String>,
}

impl Lease {
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else { return };
        for token in self.tokens.drain(..) {
            if inner.entries.remove(&token).is_some() {
                trace!(token = %token, "lease revoked callback");
            }
        }
    }
}
