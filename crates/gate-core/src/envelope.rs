//! JSON-RPC wire envelope handling.
//!
//! Requests are `{id, method, params}` objects. Responses mirror the
//! request id on the wire; frames carrying the `"rpc-notify"` sentinel
//! (server-initiated pushes) or a null id omit `id` entirely.

use crate::error::codes;
use serde_json::{json, Map, Value};

/// Sentinel id tagging a server-initiated push internally. Never appears
/// on the wire: finalization strips it.
pub const NOTIFY_ID: &str = "rpc-notify";

/// A structurally valid client request.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Correlation id, mirrored verbatim in the response.
    pub id: Value,
    /// Dotted method name, e.g. `auth.authorize`.
    pub method: String,
    /// Optional params object.
    pub params: Option<Value>,
}

impl Envelope {
    /// Structural validation of a syntactically valid payload.
    ///
    /// A payload that parsed as JSON but is not JSON-RPC shaped (not an
    /// object, missing or non-string `method`, non-object `params`) yields
    /// the invalid-request error frame to echo back to the client.
    pub fn parse(raw: Value) -> Result<Envelope, Value> {
        let id = raw.get("id").cloned().unwrap_or(Value::Null);

        let Some(obj) = raw.as_object() else {
            return Err(invalid_request(id));
        };

        let method = match obj.get("method").and_then(Value::as_str) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Err(invalid_request(id)),
        };

        let params = match obj.get("params") {
            None | Some(Value::Null) => None,
            Some(p @ Value::Object(_)) => Some(p.clone()),
            Some(_) => return Err(invalid_request(id)),
        };

        Ok(Envelope { id, method, params })
    }
}

/// Build a response payload carrying `result`.
pub fn result_response(result: Value) -> Value {
    json!({ "result": result })
}

/// Build an error response payload.
pub fn error_response(code: i64, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

/// Build a server push: a request-shaped frame tagged with the notify
/// sentinel so finalization omits the id on the wire.
pub fn notify_request(method: &str, data: Value) -> Value {
    json!({ "id": NOTIFY_ID, "method": method, "params": data })
}

fn invalid_request(id: Value) -> Value {
    let mut frame = error_response(codes::INVALID_REQUEST, "invalid request");
    if let Some(map) = frame.as_object_mut() {
        map.insert("id".into(), id);
    }
    frame
}

/// Apply the wire id rules and serialize one outbound frame.
///
/// The frame's id defaults to `default_id` when unset; null and sentinel
/// ids are then stripped so pushes and notifications carry no `id` on the
/// wire. Never fails: a serialization error degrades to a 1108 error frame.
pub fn finalize_frame(frame: Value, default_id: &Value) -> String {
    let mut map = match frame {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("result".into(), other);
            m
        }
    };

    let id = match map.remove("id") {
        None | Some(Value::Null) => default_id.clone(),
        Some(id) => id,
    };
    let omit = id.is_null() || id.as_str() == Some(NOTIFY_ID);
    if !omit {
        map.insert("id".into(), id);
    }

    match serde_json::to_string(&Value::Object(map)) {
        Ok(text) => text,
        Err(_) => {
            let mut fallback = Map::new();
            fallback.insert(
                "error".into(),
                json!({
                    "code": codes::INTERNAL_SERIALIZE,
                    "message": "internal server error on serialize message",
                }),
            );
            if !default_id.is_null() {
                fallback.insert("id".into(), default_id.clone());
            }
            serde_json::to_string(&Value::Object(fallback)).unwrap_or_default()
        }
    }
}
