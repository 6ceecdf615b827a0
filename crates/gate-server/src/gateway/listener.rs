//! WebSocket gate listener.
//!
//! Accepts client connections, assigns each a fresh channel id, extracts
//! client metadata from the handshake URI, pumps frames through a
//! per-connection select loop, runs the two-strike liveness sweep, and
//! forwards decoded requests and lifecycle events to the session router.

use crate::gateway::registry::{ConnectionRegistry, Outbound, ReplySink};
use crate::gateway::{ChannelContext, ChannelEvent};
use crate::router::SessionRouter;
use futures_util::{SinkExt, StreamExt};
use gate_core::{codes, envelope, ClientInfo, GateError, GateResult};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Accepts and owns all client connections.
pub struct GateListener {
    registry: Arc<ConnectionRegistry>,
    router: Arc<SessionRouter>,
    ping_interval: Duration,
}

impl GateListener {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<SessionRouter>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            ping_interval,
        }
    }

    /// Bind and serve until the process stops. Failure to bind is fatal.
    pub async fn run(self: Arc<Self>, host: &str, port: u16) -> GateResult<()> {
        let addr = format!("{host}:{port}");
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|e| GateError::Transport(format!("bind {addr}: {e}")))?;

        info!(addr = %addr, "frontend gate listening");

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.ping_interval);
            // The first tick fires immediately; skip it so fresh
            // connections get a full interval before their first probe.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.run_sweep().await;
            }
        });

        loop {
            match tcp.accept().await {
                Ok((stream, peer)) => {
                    let gate = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gate.handle_connection(stream, peer).await {
                            debug!(remote = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "TCP accept failed"),
            }
        }
    }

    /// One sweep pass: reap channels that missed two intervals, probe the rest.
    async fn run_sweep(&self) {
        for ctx in self.registry.sweep().await {
            warn!(channel_id = %ctx.channel_id, "reaping unresponsive channel");
            let sink = ReplySink::new(ctx.channel_id.clone(), self.registry.clone());
            self.notify_event(&ctx, ChannelEvent::Close, &sink, &Value::Null)
                .await;
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> GateResult<()> {
        // Capture the request URI and proxy header during the WS handshake.
        let mut client_info = ClientInfo::default();
        let mut client_ip = peer.ip().to_string();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            client_info = client_info_from_query(req.uri().query());
            if let Some(ip) = real_ip_header(req) {
                client_ip = ip;
            }
            Ok(resp)
        })
        .await
        .map_err(|e| GateError::Transport(format!("WS handshake: {e}")))?;

        let ctx = ChannelContext {
            channel_id: generate_channel_id(),
            client_ip,
            client_info,
        };
        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        self.registry.register(ctx.clone(), tx).await;
        let sink = ReplySink::new(ctx.channel_id.clone(), self.registry.clone());

        info!(channel_id = %ctx.channel_id, remote = %peer, "channel opened");
        self.notify_event(&ctx, ChannelEvent::Open, &sink, &Value::Null)
            .await;

        let mut error_seen = false;
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Outbound::Frame(text)) => {
                            if let Err(e) = ws.send(Message::Text(text)).await {
                                debug!(channel_id = %ctx.channel_id, error = %e, "write failed, frame skipped");
                            }
                        }
                        Some(Outbound::Ping) => {
                            if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                                debug!(channel_id = %ctx.channel_id, error = %e, "ping write failed");
                            }
                        }
                        Some(Outbound::Terminate) | None => {
                            // Terminating an already-closed connection is tolerated.
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.registry.mark_alive(&ctx.channel_id).await;
                            self.handle_frame(&ctx, &text, &sink);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.registry.mark_alive(&ctx.channel_id).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.registry.mark_alive(&ctx.channel_id).await;
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Binary and raw frames are not part of the protocol.
                            self.registry.mark_alive(&ctx.channel_id).await;
                        }
                        Some(Err(e)) => {
                            warn!(channel_id = %ctx.channel_id, client_ip = %ctx.client_ip, error = %e, "client connection error");
                            error_seen = true;
                            break;
                        }
                    }
                }
            }
        }

        if error_seen {
            let _ = ws.close(None).await;
        }

        // Local bookkeeping cleanup never depends on the router: deregister
        // first, then notify. A `false` here means the sweep already reaped
        // this channel and delivered the close event.
        if self.registry.remove(&ctx.channel_id).await {
            let event = if error_seen {
                ChannelEvent::Error
            } else {
                ChannelEvent::Close
            };
            self.notify_event(&ctx, event, &sink, &Value::Null).await;
            info!(channel_id = %ctx.channel_id, "channel closed");
        }

        Ok(())
    }

    /// Forward a lifecycle event to the router. Router failures are caught,
    /// logged, and degraded to a best-effort error frame; they never
    /// propagate into the connection loop.
    async fn notify_event(
        &self,
        ctx: &ChannelContext,
        event: ChannelEvent,
        sink: &ReplySink,
        default_id: &Value,
    ) {
        if let Err(e) = self.router.handle_event(ctx, event, sink).await {
            error!(channel_id = %ctx.channel_id, ?event, error = %e, "router failed to process lifecycle event");
            let _ = sink
                .send(
                    envelope::error_response(
                        codes::INTERNAL_RESPONSE,
                        "internal server error on response to client",
                    ),
                    default_id,
                )
                .await;
        }
    }

    /// Decode one inbound frame and hand it to the router.
    ///
    /// Syntax errors are logged and dropped. Frames without an id are
    /// notifications, which this protocol does not accept inbound —
    /// silently dropped. Requests are dispatched in their own task so a
    /// slow backend call never serializes the channel.
    fn handle_frame(&self, ctx: &ChannelContext, text: &str, sink: &ReplySink) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel_id = %ctx.channel_id, client_ip = %ctx.client_ip, error = %e, "malformed frame dropped");
                return;
            }
        };

        match raw.get("id") {
            None | Some(Value::Null) => return,
            Some(_) => {}
        }

        let request_id = raw.get("id").cloned().unwrap_or(Value::Null);
        let router = self.router.clone();
        let ctx = ctx.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Err(e) = router.handle_request(&ctx, raw, &sink).await {
                error!(channel_id = %ctx.channel_id, error = %e, "router failed to process request");
                let _ = sink
                    .send(
                        envelope::error_response(
                            codes::INTERNAL_RESPONSE,
                            "internal server error on response to client",
                        ),
                        &request_id,
                    )
                    .await;
            }
        });
    }
}

/// Opaque channel id: 16 random bytes, hex-encoded. Never reused.
fn generate_channel_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Best-effort client metadata from the connection URI query string.
/// Unknown parameters are ignored; nothing here rejects a connection.
fn client_info_from_query(query: Option<&str>) -> ClientInfo {
    let mut info = ClientInfo::default();
    let Some(query) = query else {
        return info;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "platform" => info.platform = Some(value),
            "deviceType" => info.device_type = Some(value),
            "clientType" => info.client_type = Some(value),
            "version" => info.version = Some(value),
            "deviceId" => info.device_id = Some(value),
            _ => {}
        }
    }
    info
}

/// Client IP as seen by an upstream proxy: first entry of `x-real-ip`,
/// falling back to the socket peer address at the call site.
fn real_ip_header(req: &Request) -> Option<String> {
    let value = req.headers().get("x-real-ip")?.to_str().ok()?;
    value
        .split(',')
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
