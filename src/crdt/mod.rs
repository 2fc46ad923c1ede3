//! Thin adapter over the `yrs` CRDT library.
//!
//! The engine treats the document opaquely through three hooks: apply a sync
//! payload, produce sync-step payloads, and observe merged updates. Structured
//! access for notebooks and text files lives in [`notebook`].

pub mod awareness;
pub mod notebook;

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, ReadTxn, StateVector, Transact, Update};

/// Create an empty document replica.
pub fn new_doc() -> Doc {
    Doc::new()
}

/// Handle a SyncStep1 payload (the peer's state vector): returns the
/// SyncStep2 reply payload containing everything the peer is missing.
pub fn handle_sync_step1(doc: &Doc, state_vector: &[u8]) -> Result<Vec<u8>> {
    let sv = StateVector::decode_v1(state_vector).map_err(|e| Error::Crdt(e.to_string()))?;
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&sv))
}

/// Apply a SyncStep2 or SyncUpdate payload to the document.
pub fn apply_update(doc: &Doc, payload: &[u8]) -> Result<()> {
    let update = Update::decode_v1(payload).map_err(|e| Error::Crdt(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| Error::Crdt(e.to_string()))
}

/// Encode this document's state vector, the payload of our own SyncStep1.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Convert a `yrs` value into JSON.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map.iter() {
                object.insert(key.clone(), any_to_json(value));
            }
            Value::Object(object)
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

/// Convert JSON into a `yrs` value.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::String(s.clone().into()),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(converted.into())
        }
        Value::Object(object) => {
            let converted: HashMap<String, Any> = object
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(converted.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::Map;

    #[test]
    fn test_sync_step1_step2_converges() {
        let server = new_doc();
        {
            let map = server.get_or_insert_map("meta");
            let mut txn = server.transact_mut();
            map.insert(&mut txn, "nbformat", 4i64);
        }

        let client = new_doc();
        // Client announces its (empty) state, server replies with the diff.
        let reply = handle_sync_step1(&server, &state_vector(&client)).unwrap();
        apply_update(&client, &reply).unwrap();

        assert_eq!(state_vector(&client), state_vector(&server));
    }

    #[test]
    fn test_apply_update_rejects_garbage() {
        let doc = new_doc();
        assert!(apply_update(&doc, &[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_json_any_roundtrip() {
        let value = json!({
            "name": "stdout",
            "count": 3,
            "ratio": 0.5,
            "nested": {"ok": true, "items": [1, "two", null]}
        });
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }
}
