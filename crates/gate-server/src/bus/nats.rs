//! NATS transport for the internal bus.
//!
//! Outbound calls go request/reply on `{service}.{method}` subjects.
//! Inbound, the gate subscribes to `{prefix}.>` and serves its routes,
//! with the route name taken from the last subject token.

use super::{dispatch_route, BusClient};
use crate::router::SessionRouter;
use async_trait::async_trait;
use futures_util::StreamExt;
use gate_core::{GateError, GateResult};
use rand::RngCore;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> GateResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| GateError::Bus(format!("nats connect to {url}: {e}")))?;
        info!(url = %url, "connected to bus");
        Ok(Self { client })
    }

    /// Subscribe to the gate's inbound subjects and serve route requests
    /// until the subscription ends.
    pub async fn serve_routes(
        &self,
        prefix: &str,
        router: Arc<SessionRouter>,
    ) -> GateResult<()> {
        let subject = format!("{prefix}.>");
        let mut subscription = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| GateError::Bus(format!("subscribe {subject}: {e}")))?;
        info!(subject = %subject, "serving inbound routes");

        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let route = message
                    .subject
                    .rsplit('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let Some(reply_to) = message.reply.clone() else {
                    debug!(route = %route, "dropping inbound request without reply subject");
                    continue;
                };
                let payload: Value = match serde_json::from_slice(&message.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(route = %route, error = %e, "undecodable inbound payload");
                        continue;
                    }
                };

                let reply = dispatch_route(&router, &route, payload).await;
                match serde_json::to_vec(&reply) {
                    Ok(bytes) => {
                        if let Err(e) = client.publish(reply_to, bytes.into()).await {
                            error!(route = %route, error = %e, "failed to publish reply");
                        }
                    }
                    Err(e) => error!(route = %route, error = %e, "failed to encode reply"),
                }
            }
            warn!("inbound route subscription ended");
        });
        Ok(())
    }
}

#[async_trait]
impl BusClient for NatsBus {
    async fn call(&self, service: &str, method: &str, params: Value) -> GateResult<Value> {
        let subject = format!("{service}.{method}");
        let request = json!({
            "id": request_id(),
            "method": method,
            "params": params,
        });
        let body = serde_json::to_vec(&request)
            .map_err(|e| GateError::Bus(format!("encode request for {subject}: {e}")))?;

        let response = self
            .client
            .request(subject.clone(), body.into())
            .await
            .map_err(|e| GateError::Bus(format!("request {subject}: {e}")))?;

        serde_json::from_slice(&response.payload)
            .map_err(|e| GateError::Bus(format!("decode response from {subject}: {e}")))
    }
}

fn request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
