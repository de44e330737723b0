//! # Bridgewire
//!
//! The envelope every cross-context message travels in.
//!
//! Contexts share no memory; the only thing that crosses between them is an
//! `Envelope`, serialized as JSON. An envelope is a small header (correlation
//! id, fan-out metadata, timestamp) plus a `Body`, which is a closed sum over
//! the three commands the bridge speaks.
//!
//! ## Philosophy
//!
//! - **Closed commands**: `Body` is matched exhaustively by the router. Messages
//!   whose `cmd` belongs to some other subsystem decode to
//!   `Error::UnknownCommand`, so callers can let them pass untouched.
//! - **Data only**: function values never cross. A callback travels as a token
//!   object (`{"$callback": "<name>"}`) inside the argument list.

use std::collections::BTreeMap;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

mod error;

pub use error::Error;
pub use error::Result;

#[cfg(test)]
mod tests;

/// Identifier linking a call's request to its eventual response.
pub type CorrelationId = u64;

/// Result carried by a `response`: a value, or the callee's stringified error.
pub type Outcome = std::result::Result<Value, String>;

/// Key of the single-field object standing in for a function argument.
pub const CALLBACK_KEY: &str = "$callback";

/// The command tag of an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    DataSync,
    Invoke,
    Response,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataSync => "dataSync",
            Self::Invoke => "invoke",
            Self::Response => "response",
        }
    }

    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "dataSync" => Some(Self::DataSync),
            "invoke" => Some(Self::Invoke),
            "response" => Some(Self::Response),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata stamped on every envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Present on invocations that expect a reply, and on the reply itself.
    pub correlation_id: Option<CorrelationId>,
    /// Index of the worker a fan-out copy was addressed to.
    pub target_index: Option<u32>,
    /// Fan-out sequence id, fresh for every copy sent.
    pub sequence: Option<u64>,
    /// Milliseconds since the UNIX epoch at the time of stamping.
    pub timestamp: u64,
}

impl Header {
    fn now(correlation_id: Option<CorrelationId>) -> Self {
        Self {
            correlation_id,
            target_index: None,
            sequence: None,
            timestamp: now_millis(),
        }
    }
}

/// A request to run a named function on the receiving context.
#[derive(Clone, Debug, PartialEq)]
pub struct Invoke {
    pub func_name: String,
    pub args: Vec<Value>,
}

/// Module-visible data pushed to a context: an opaque project payload plus
/// the table resolving logical asset names to fetchable locations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
}

/// The payload of an envelope, tagged by command.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    DataSync(SyncData),
    Invoke(Invoke),
    Response(Outcome),
}

impl Body {
    pub fn command(&self) -> Command {
        match self {
            Self::DataSync(_) => Command::DataSync,
            Self::Invoke(_) => Command::Invoke,
            Self::Response(_) => Command::Response,
        }
    }
}

/// The structured message unit exchanged between contexts.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub body: Body,
}

impl Envelope {
    /// An invocation of `func_name`. Without a correlation id the call is
    /// fire-and-forget and the callee sends no response.
    pub fn invoke(
        correlation_id: Option<CorrelationId>,
        func_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            header: Header::now(correlation_id),
            body: Body::Invoke(Invoke {
                func_name: func_name.into(),
                args,
            }),
        }
    }

    /// The answer to the invocation that carried `correlation_id`.
    pub fn response(correlation_id: CorrelationId, outcome: Outcome) -> Self {
        Self {
            header: Header::now(Some(correlation_id)),
            body: Body::Response(outcome),
        }
    }

    /// A data push. With a correlation id the receiver acknowledges it.
    pub fn data_sync(correlation_id: Option<CorrelationId>, data: SyncData) -> Self {
        Self {
            header: Header::now(correlation_id),
            body: Body::DataSync(data),
        }
    }

    /// A copy stamped for one worker of a fan-out.
    pub fn stamped(&self, sequence: u64, target_index: u32) -> Self {
        Self {
            header: Header {
                correlation_id: self.header.correlation_id,
                target_index: Some(target_index),
                sequence: Some(sequence),
                timestamp: now_millis(),
            },
            body: self.body.clone(),
        }
    }

    /// Replaces the correlation id, keeping everything else.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.header.correlation_id = Some(correlation_id);
        self
    }

    pub fn command(&self) -> Command {
        self.body.command()
    }
}

// ============================================================================
//  WIRE FORMAT
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    payload: WirePayload,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    func_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assets: Option<BTreeMap<String, String>>,
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        let mut payload = WirePayload::default();
        match &envelope.body {
            Body::DataSync(sync) => {
                payload.data = Some(sync.data.clone());
                payload.assets = Some(sync.assets.clone());
            }
            Body::Invoke(invoke) => {
                payload.func_name = Some(invoke.func_name.clone());
                payload.args = Some(invoke.args.clone());
            }
            Body::Response(Ok(value)) => payload.result = Some(value.clone()),
            Body::Response(Err(error)) => payload.error = Some(error.clone()),
        }

        Self {
            cmd: envelope.command().as_str().to_string(),
            correlation_id: envelope.header.correlation_id,
            target_index: envelope.header.target_index,
            sequence: envelope.header.sequence,
            timestamp: Some(envelope.header.timestamp),
            payload,
        }
    }
}

impl WireEnvelope {
    fn into_envelope(self, command: Command) -> Result<Envelope> {
        let timestamp = self.timestamp.ok_or(Error::MissingField("timestamp"))?;
        let payload = self.payload;

        let body = match command {
            Command::DataSync => Body::DataSync(SyncData {
                data: payload.data.unwrap_or(Value::Null),
                assets: payload.assets.unwrap_or_default(),
            }),
            Command::Invoke => Body::Invoke(Invoke {
                func_name: payload.func_name.ok_or(Error::MissingField("payload.funcName"))?,
                args: payload.args.unwrap_or_default(),
            }),
            Command::Response => {
                if self.correlation_id.is_none() {
                    return Err(Error::MissingField("correlationId"));
                }
                match payload.error {
                    Some(error) => Body::Response(Err(error)),
                    None => Body::Response(Ok(payload.result.unwrap_or(Value::Null))),
                }
            }
        };

        Ok(Envelope {
            header: Header {
                correlation_id: self.correlation_id,
                target_index: self.target_index,
                sequence: self.sequence,
                timestamp,
            },
            body,
        })
    }
}

/// Serializes an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(&WireEnvelope::from(envelope)).map_err(|e| Error::Encode(e.to_string()))
}

/// Parses an envelope from its JSON wire form.
///
/// A well-formed message whose `cmd` is not one of ours yields
/// `Error::UnknownCommand` rather than `Error::Malformed`.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))?;

    let cmd = raw
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Malformed("missing string field 'cmd'".into()))?;

    let Some(command) = Command::parse(cmd) else {
        return Err(Error::UnknownCommand(cmd.to_string()));
    };

    let wire: WireEnvelope =
        serde_json::from_value(raw).map_err(|e| Error::Malformed(e.to_string()))?;
    wire.into_envelope(command)
}

// ============================================================================
//  CALLBACK TOKENS
// ============================================================================

/// The wire stand-in for a function argument named `token`.
pub fn callback_value(token: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(CALLBACK_KEY.to_string(), Value::String(token.to_string()));
    Value::Object(map)
}

/// Returns the token name if `value` is a callback stand-in.
pub fn callback_token(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(CALLBACK_KEY)?.as_str()
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
