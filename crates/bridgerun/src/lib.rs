//! # Bridgerun
//!
//! Lets code in isolated execution contexts call functions across context
//! boundaries as if they were local asynchronous calls. Contexts share no
//! memory and talk only through `bridgewire` envelopes over a `Transport`.
//!
//! One context may host the logic module (a WebAssembly binary run with
//! wasmtime); its readiness gate queues calls until the module is usable.

pub mod asset;
pub mod bridge;
pub mod callback;
pub mod capability;
pub mod channel;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gate;
pub mod module;
pub mod pending;
pub mod status;
pub mod store;
pub mod transport;

mod router;

pub use bridge::Bridge;
pub use bridge::BridgeBuilder;
pub use bridge::LinkId;
pub use bridge::Peer;
pub use callback::CallArg;
pub use capability::Args;
pub use capability::Capabilities;
pub use capability::Handler;
pub use capability::HandlerResult;
pub use config::BridgeConfig;
pub use config::ModuleConfig;
pub use error::Error;
pub use error::Result;
pub use gate::Gate;
pub use gate::ModuleState;
