//! Live connection registry and liveness bookkeeping.
//!
//! Owned exclusively by the listener. The router reaches connections only
//! through [`ReplySink`] capabilities handed out at accept time; a sink
//! whose channel has been removed degrades to a logged no-op.

use crate::gateway::ChannelContext;
use gate_core::{envelope, GateError, GateResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Commands consumed by a connection's frame pump.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized frame to deliver to the client.
    Frame(String),
    /// Transport-level liveness probe.
    Ping,
    /// Force-terminate the connection.
    Terminate,
}

struct ConnEntry {
    sender: mpsc::Sender<Outbound>,
    /// Two-strike liveness flag: set by the sweep, cleared by any inbound
    /// frame (data or pong).
    probed: bool,
    context: ChannelContext,
}

/// The live set of accepted connections, keyed by channel id.
pub struct ConnectionRegistry {
    channels: RwLock<HashMap<String, ConnEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly accepted connection, alive by definition.
    pub async fn register(&self, context: ChannelContext, sender: mpsc::Sender<Outbound>) {
        let mut channels = self.channels.write().await;
        channels.insert(
            context.channel_id.clone(),
            ConnEntry {
                sender,
                probed: false,
                context,
            },
        );
    }

    /// Remove a connection. Returns `true` when it was still registered,
    /// so callers can tell a first removal from a reap that already ran.
    pub async fn remove(&self, channel_id: &str) -> bool {
        self.channels.write().await.remove(channel_id).is_some()
    }

    /// Clear the liveness flag: any inbound frame counts as life.
    pub async fn mark_alive(&self, channel_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels.get_mut(channel_id) {
            entry.probed = false;
        }
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Two-strike liveness sweep.
    ///
    /// Connections still flagged from the previous sweep missed a full
    /// interval: they are deregistered, sent a terminate command, and
    /// returned for reaping. Everything else is flagged and pinged.
    pub async fn sweep(&self) -> Vec<ChannelContext> {
        let mut reaped = Vec::new();
        let mut channels = self.channels.write().await;
        channels.retain(|id, entry| {
            if entry.probed {
                let _ = entry.sender.try_send(Outbound::Terminate);
                reaped.push(entry.context.clone());
                false
            } else {
                entry.probed = true;
                if entry.sender.try_send(Outbound::Ping).is_err() {
                    debug!(channel_id = %id, "ping enqueue failed, outbound queue backlogged");
                }
                true
            }
        });
        reaped
    }

    async fn sender(&self, channel_id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|entry| entry.sender.clone())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery capability bound to a single channel.
///
/// Cheap to clone. Registered with the router on `open` and dropped on
/// `close`/`error`; delivery after the channel closed is a logged no-op,
/// never an error.
#[derive(Clone)]
pub struct ReplySink {
    channel_id: String,
    registry: Arc<ConnectionRegistry>,
}

impl ReplySink {
    pub fn new(channel_id: String, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            channel_id,
            registry,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Serialize and enqueue one frame, applying the wire id rules.
    ///
    /// Skipped (and logged) when the channel is no longer registered.
    /// Fails only when the connection is live but its outbound queue
    /// cannot accept the frame.
    pub async fn send(&self, frame: Value, default_id: &Value) -> GateResult<()> {
        let Some(sender) = self.registry.sender(&self.channel_id).await else {
            debug!(channel_id = %self.channel_id, "client closed connection before response");
            return Ok(());
        };
        let text = envelope::finalize_frame(frame, default_id);
        sender
            .try_send(Outbound::Frame(text))
            .map_err(|e| GateError::Notify(format!("outbound queue: {e}")))
    }

    /// Deliver a server push: no correlation id, sentinel-tagged.
    pub async fn notify(&self, method: &str, data: Value) -> GateResult<()> {
        self.send(envelope::notify_request(method, data), &Value::Null)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::ClientInfo;
    use serde_json::json;

    fn ctx(id: &str) -> ChannelContext {
        ChannelContext {
            channel_id: id.to_string(),
            client_ip: "10.0.0.1".to_string(),
            client_info: ClientInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_register_remove_no_leak() {
        let registry = ConnectionRegistry::new();
        let before = registry.len().await;

        let (tx, _rx) = mpsc::channel(4);
        registry.register(ctx("c1"), tx).await;
        assert_eq!(registry.len().await, before + 1);

        assert!(registry.remove("c1").await);
        assert!(!registry.remove("c1").await);
        assert_eq!(registry.len().await, before);
    }

    #[tokio::test]
    async fn test_sweep_two_strike_reaps_silent_channel() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(ctx("c1"), tx).await;

        // First sweep: survives, gets probed.
        let reaped = registry.sweep().await;
        assert!(reaped.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));

        // Second sweep with no answer: reaped and deregistered.
        let reaped = registry.sweep().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].channel_id, "c1");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Terminate)));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_responsive_channel_never_reaped() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.register(ctx("c1"), tx).await;

        for _ in 0..5 {
            assert!(registry.sweep().await.is_empty());
            assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));
            // The pong arrives before the next sweep.
            registry.mark_alive("c1").await;
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_sink_is_noop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = ReplySink::new("ghost".into(), registry.clone());
        assert!(sink.send(json!({"result": 1}), &json!("1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_sink_applies_id_rules() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(ctx("c1"), tx).await;

        let sink = ReplySink::new("c1".into(), registry.clone());
        sink.send(json!({"result": {"ok": true}}), &json!("7"))
            .await
            .unwrap();

        let Ok(Outbound::Frame(text)) = rx.try_recv() else {
            panic!("expected a frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, json!({"id": "7", "result": {"ok": true}}));
    }
}
