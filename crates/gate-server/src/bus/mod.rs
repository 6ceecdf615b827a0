//! Internal RPC bus abstraction.
//!
//! Outbound, the router calls backend services through [`BusClient`];
//! inbound, backends reach the gate through a small set of routes
//! (`transfer`, `checkChannel`, `checkChannels`) that [`dispatch_route`]
//! validates and maps onto the router.

pub mod nats;

use crate::router::SessionRouter;
use async_trait::async_trait;
use gate_core::{codes, envelope, GateError, GateResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

/// Request/reply client for backend services.
///
/// `call` sends one JSON-RPC request to `service` and resolves with the
/// full response object, result or error alike. Only transport-level
/// failures surface as `Err`.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn call(&self, service: &str, method: &str, params: Value) -> GateResult<Value>;
}

/// `transfer` payload: push a frame to one channel. `error` wins over
/// `data` when both are present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParams {
    pub channel_id: String,
    pub method: String,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckChannelParams {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckChannelsParams {
    pub channels_ids: Vec<String>,
}

/// Handle one inbound bus request and produce the JSON-RPC reply.
pub async fn dispatch_route(router: &SessionRouter, route: &str, payload: Value) -> Value {
    let request_id = payload.get("id").cloned().unwrap_or(Value::Null);
    let params = payload.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match route {
        "transfer" => match parse_params::<TransferParams>(params) {
            Ok(p) => router.transfer(p).await,
            Err(e) => Err(e),
        },
        "checkChannel" => match parse_params::<CheckChannelParams>(params) {
            Ok(p) => Ok(router.check_channel(p).await),
            Err(e) => Err(e),
        },
        "checkChannels" => match parse_params::<CheckChannelsParams>(params) {
            Ok(p) if p.channels_ids.is_empty() => Err(GateError::InvalidMessage(
                "channelsIds must not be empty".to_string(),
            )),
            Ok(p) => Ok(router.check_channels(p).await),
            Err(e) => Err(e),
        },
        other => {
            warn!(route = %other, "unknown inbound route");
            Err(GateError::UnknownRoute(other.to_string()))
        }
    };

    let mut reply = match outcome {
        Ok(result) => json!({ "result": result }),
        Err(e) => {
            let (code, message) = error_reply(&e);
            envelope::error_response(code, &message)
        }
    };
    if let Some(map) = reply.as_object_mut() {
        map.insert("id".into(), request_id);
    }
    reply
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> GateResult<T> {
    serde_json::from_value(params).map_err(|e| GateError::InvalidMessage(e.to_string()))
}

fn error_reply(e: &GateError) -> (i64, String) {
    match e {
        GateError::ChannelNotFound(id) => {
            (codes::CHANNEL_NOT_FOUND, format!("channel not found: {id}"))
        }
        GateError::Notify(_) => (
            codes::NOTIFY_FATAL,
            "failed to deliver notification to channel".to_string(),
        ),
        GateError::UnknownRoute(route) => {
            (codes::METHOD_NOT_FOUND, format!("unknown route: {route}"))
        }
        GateError::InvalidMessage(m) => (codes::INVALID_PARAMS, m.clone()),
        other => (codes::INTERNAL_RESPONSE, other.to_string()),
    }
}
