use serde_json::Value;
use serde_json::json;

use crate::Body;
use crate::Command;
use crate::Envelope;
use crate::Error;
use crate::SyncData;
use crate::callback_token;
use crate::callback_value;
use crate::decode;
use crate::encode;

fn to_json(envelope: &Envelope) -> Value {
    serde_json::from_slice(&encode(envelope).unwrap()).unwrap()
}

#[test]
fn test_invoke_wire_shape() {
    let envelope = Envelope::invoke(Some(7), "add", vec![json!(2), json!(3)]);
    let wire = to_json(&envelope);

    assert_eq!(wire["cmd"], "invoke");
    assert_eq!(wire["correlationId"], 7);
    assert_eq!(wire["payload"]["funcName"], "add");
    assert_eq!(wire["payload"]["args"], json!([2, 3]));
    assert!(wire["timestamp"].is_u64());
    // Fan-out metadata is only present on stamped copies.
    assert!(wire.get("targetIndex").is_none());
    assert!(wire.get("sequence").is_none());
}

#[test]
fn test_response_error_survives_the_wire() {
    let envelope = Envelope::response(3, Err("boom".into()));
    let decoded = decode(&encode(&envelope).unwrap()).unwrap();

    assert_eq!(decoded.header.correlation_id, Some(3));
    assert_eq!(decoded.body, Body::Response(Err("boom".into())));
}

#[test]
fn test_null_result_decodes_as_ok() {
    let bytes = br#"{"cmd":"response","correlationId":1,"timestamp":5,"payload":{"result":null}}"#;
    let decoded = decode(bytes).unwrap();
    assert_eq!(decoded.body, Body::Response(Ok(Value::Null)));
}

#[test]
fn test_data_sync_carries_assets() {
    let mut sync = SyncData {
        data: json!({"title": "demo"}),
        ..Default::default()
    };
    sync.assets.insert("logic.wasm".into(), "assets/logic-3f2a.wasm".into());

    let decoded = decode(&encode(&Envelope::data_sync(None, sync.clone())).unwrap()).unwrap();
    assert_eq!(decoded.command(), Command::DataSync);
    assert_eq!(decoded.body, Body::DataSync(sync));
}

#[test]
fn test_stamped_copy_refreshes_metadata() {
    let original = Envelope::invoke(None, "tick", vec![]);
    let copy = original.stamped(41, 2);

    assert_eq!(copy.header.sequence, Some(41));
    assert_eq!(copy.header.target_index, Some(2));
    assert_eq!(copy.header.correlation_id, None);
    assert!(copy.header.timestamp >= original.header.timestamp);
    assert_eq!(copy.body, original.body);

    let wire = to_json(&copy);
    assert_eq!(wire["targetIndex"], 2);
    assert_eq!(wire["sequence"], 41);
}

#[test]
fn test_unknown_command_is_distinguished() {
    let bytes = br#"{"cmd":"run","handler":"engine"}"#;
    match decode(bytes) {
        Err(Error::UnknownCommand(cmd)) => assert_eq!(cmd, "run"),
        other => panic!("expected UnknownCommand, got {:?}", other),
    }
}

#[test]
fn test_malformed_inputs() {
    assert!(matches!(decode(b"not json"), Err(Error::Malformed(_))));
    assert!(matches!(decode(br#"{"payload":{}}"#), Err(Error::Malformed(_))));
    assert!(matches!(decode(br#"{"cmd":"invoke","timestamp":"soon"}"#), Err(Error::Malformed(_))));
}

#[test]
fn test_missing_fields() {
    let no_timestamp = br#"{"cmd":"invoke","payload":{"funcName":"f"}}"#;
    assert_eq!(decode(no_timestamp), Err(Error::MissingField("timestamp")));

    let no_name = br#"{"cmd":"invoke","timestamp":1,"payload":{}}"#;
    assert_eq!(decode(no_name), Err(Error::MissingField("payload.funcName")));

    let uncorrelated_reply = br#"{"cmd":"response","timestamp":1,"payload":{"result":1}}"#;
    assert_eq!(decode(uncorrelated_reply), Err(Error::MissingField("correlationId")));
}

#[test]
fn test_callback_tokens() {
    let value = callback_value("_onBridgeCall_1700000000000_4");
    assert_eq!(callback_token(&value), Some("_onBridgeCall_1700000000000_4"));

    assert_eq!(callback_token(&json!("_onBridgeCall_1")), None);
    assert_eq!(callback_token(&json!({"$callback": 3})), None);
    assert_eq!(callback_token(&json!({"$callback": "a", "extra": true})), None);
}
