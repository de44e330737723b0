//! # Message Router
//!
//! Demultiplexes envelopes read by a link's pump. The pump never waits for a
//! handler: invocations run on their own task, so a slow function does not
//! hold up the responses queued behind it.

use bridgewire::Body;
use bridgewire::CorrelationId;
use bridgewire::Envelope;
use bridgewire::Invoke;
use bridgewire::SyncData;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::bridge::Peer;
use crate::capability::Args;
use crate::error::Error;
use crate::gate::Gate;
use crate::gate::ModuleState;

/// Routes one raw message received over `peer`.
pub(crate) fn route(peer: &Peer, bytes: Vec<u8>) {
    let envelope = match bridgewire::decode(&bytes) {
        Ok(envelope) => envelope,
        Err(bridgewire::Error::UnknownCommand(cmd)) => {
            passthrough(peer, &cmd, bytes);
            return;
        }
        Err(e) => {
            warn!(bridge = %peer.owner(), link = %peer.link(), error = %e, "dropping malformed message");
            return;
        }
    };

    let Envelope { header, body } = envelope;
    trace!(bridge = %peer.owner(), link = %peer.link(), cmd = %body.command(), id = ?header.correlation_id, "routing envelope");

    match body {
        Body::DataSync(data) => data_sync(peer, header.correlation_id, data),
        Body::Invoke(invoke) => self::invoke(peer, header.correlation_id, invoke),
        Body::Response(outcome) => response(peer, header.correlation_id, outcome),
    }
}

fn passthrough(peer: &Peer, cmd: &str, bytes: Vec<u8>) {
    match &peer.shared().passthrough {
        Some(tx) => {
            debug!(bridge = %peer.owner(), cmd, "forwarding message for another subsystem");
            if tx.send(bytes).is_err() {
                debug!(bridge = %peer.owner(), cmd, "pass-through receiver is gone");
            }
        }
        None => debug!(bridge = %peer.owner(), cmd, "ignoring message with unknown command"),
    }
}

fn data_sync(peer: &Peer, id: Option<CorrelationId>, data: SyncData) {
    let shared = peer.shared();
    let hosting = shared
        .hosting
        .as_ref()
        .map(|hosting| (hosting.gate.clone(), hosting.template.clone()));
    let payload = data.data.clone();

    let version = shared.store.update(data);
    debug!(bridge = %peer.owner(), version, "data store updated");
    let location = hosting
        .as_ref()
        .and_then(|(_, template)| shared.store.asset_location(&template.module));

    if let Some((gate, template)) = hosting {
        let idle = matches!(gate.state(), ModuleState::Uninitialized | ModuleState::Failed { .. });
        match location {
            Some(location) if idle => {
                debug!(bridge = %peer.owner(), module = %template.module, %location, "data sync triggers module initialization");
                let data_export = template.data_export.clone();
                let config = template.with_module(location);
                tokio::spawn(async move {
                    match gate.initialize(config).await {
                        Ok(_) => forward_data(&gate, data_export, payload).await,
                        Err(e) => warn!(error = %e, "module initialization triggered by data sync failed"),
                    }
                });
            }
            _ if gate.state() == ModuleState::Ready => {
                tokio::spawn(async move { forward_data(&gate, template.data_export, payload).await });
            }
            _ => {}
        }
    }

    if let Some(id) = id {
        let peer = peer.clone();
        tokio::spawn(async move { peer.respond(id, Ok(Value::Null)).await });
    }
}

/// Hands synced data to the module's data export, when it has one.
async fn forward_data(gate: &Gate, export: Option<String>, data: Value) {
    let Some(export) = export else { return };
    if data.is_null() || !gate.is_exported(&export) {
        return;
    }
    match gate.call(&export, Args::from_values(vec![data])).await {
        Ok(_) => debug!(function = %export, "synced data forwarded to module"),
        Err(e) => warn!(function = %export, error = %e, "module rejected synced data"),
    }
}

fn invoke(peer: &Peer, id: Option<CorrelationId>, invoke: Invoke) {
    let Invoke { func_name, args } = invoke;
    let args = Args::from_wire(args, Some(peer));
    let peer = peer.clone();

    tokio::spawn(async move {
        let outcome = peer.shared().dispatch(&func_name, args).await;
        if let Err(e) = &outcome {
            debug!(bridge = %peer.owner(), function = %func_name, error = %e, "invocation failed");
        }

        let Some(id) = id else { return };
        let outcome = outcome.map_err(|e| match e {
            Error::Remote(message) => message,
            other => other.to_string(),
        });
        peer.respond(id, outcome).await;
    });
}

fn response(peer: &Peer, id: Option<CorrelationId>, outcome: bridgewire::Outcome) {
    let Some(id) = id else {
        warn!(bridge = %peer.owner(), "dropping response without a correlation id");
        return;
    };

    if !peer.shared().pending.settle(id, outcome.map_err(Error::Remote)) {
        debug!(bridge = %peer.owner(), id, "dropping response for unknown or settled call");
    }
}
