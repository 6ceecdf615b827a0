//! Session router: per-channel auth state and backend dispatch.
//!
//! Owns the reply-binding and auth-session maps. Interprets client
//! requests in the context of a channel's auth state, forwards them to
//! the `auth` or `facade` backends over the bus, and exposes the inbound
//! surface backends use to push to a channel or query channel liveness.
//!
//! Per-channel auth state machine: `Anonymous → Authenticated → Anonymous`.
//! A successful `auth.authorize` stores the session; logout, close, and
//! error all funnel through the same teardown. Absence of a session is a
//! valid state — anonymous requests still reach the facade.

use crate::bus::{BusClient, CheckChannelParams, CheckChannelsParams, TransferParams};
use crate::config::GateConfig;
use crate::gateway::registry::ReplySink;
use crate::gateway::{ChannelContext, ChannelEvent};
use gate_core::{codes, envelope, Envelope, GateError, GateResult, NOTIFY_ID};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const METHOD_GENERATE_SECRET: &str = "auth.generateSecret";
const METHOD_AUTHORIZE: &str = "auth.authorize";
const METHOD_LOGOUT: &str = "auth.logout";

/// Routes client traffic between live channels and backend services.
pub struct SessionRouter {
    bus: Arc<dyn BusClient>,
    auth_enabled: bool,
    auth_service: String,
    facade_service: String,
    /// channel id → reply capability. Registered on open, removed on
    /// close/error.
    pipes: RwLock<HashMap<String, ReplySink>>,
    /// channel id → `auth.authorize` result. At most one per channel.
    sessions: RwLock<HashMap<String, Value>>,
}

impl SessionRouter {
    pub fn new(bus: Arc<dyn BusClient>, config: &GateConfig) -> Self {
        Self {
            bus,
            auth_enabled: config.auth_enabled,
            auth_service: config.auth_service.clone(),
            facade_service: config.facade_service.clone(),
            pipes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Handle a channel lifecycle event from the listener.
    pub async fn handle_event(
        &self,
        ctx: &ChannelContext,
        event: ChannelEvent,
        sink: &ReplySink,
    ) -> GateResult<()> {
        match event {
            ChannelEvent::Open => {
                self.pipes
                    .write()
                    .await
                    .insert(ctx.channel_id.clone(), sink.clone());

                if self.auth_enabled {
                    // One-time secret for the auth handshake, pushed as a
                    // `sign` server push before the client sends anything.
                    let response = self
                        .bus
                        .call(
                            &self.auth_service,
                            METHOD_GENERATE_SECRET,
                            json!({ "channelId": ctx.channel_id }),
                        )
                        .await?;
                    let secret = response
                        .get("result")
                        .and_then(|r| r.get("secret"))
                        .cloned()
                        .ok_or_else(|| {
                            GateError::Bus("auth.generateSecret returned no secret".into())
                        })?;
                    sink.notify("sign", json!({ "secret": secret })).await?;
                }
                Ok(())
            }
            ChannelEvent::Close | ChannelEvent::Error => self.client_offline(&ctx.channel_id).await,
        }
    }

    /// Handle one decoded client request.
    pub async fn handle_request(
        &self,
        ctx: &ChannelContext,
        raw: Value,
        sink: &ReplySink,
    ) -> GateResult<()> {
        let request = match Envelope::parse(raw) {
            Ok(request) => request,
            Err(invalid) => {
                // Syntactically valid but not JSON-RPC shaped: echo the
                // structural error back unchanged.
                let id = invalid.get("id").cloned().unwrap_or(Value::Null);
                return sink.send(invalid, &id).await;
            }
        };

        if request.method == METHOD_LOGOUT {
            // Logout deliberately emits no response; clients treat it as
            // fire-and-forget even though it carries an id.
            debug!(channel_id = %ctx.channel_id, "logout, tearing down session");
            return self.client_offline(&ctx.channel_id).await;
        }

        self.dispatch(ctx, request, sink).await
    }

    /// Classify by method name, call the backend, and reply.
    async fn dispatch(
        &self,
        ctx: &ChannelContext,
        request: Envelope,
        sink: &ReplySink,
    ) -> GateResult<()> {
        let request_id = request.id.clone();

        let outcome = if self.is_auth_method(&request.method) {
            self.call_auth(ctx, &request).await
        } else {
            self.call_facade(ctx, &request).await
        };

        match outcome {
            Ok(mut response) => {
                // The wire id always mirrors the request, whatever the
                // backend put there.
                if let Some(map) = response.as_object_mut() {
                    map.insert("id".into(), request_id.clone());
                }
                sink.send(response, &request_id).await
            }
            Err(e) => {
                // Full detail stays server-side; the client gets a code.
                error!(
                    channel_id = %ctx.channel_id,
                    method = %request.method,
                    error = %e,
                    "failed to pass data from client to facade"
                );
                sink.send(
                    envelope::error_response(
                        codes::BACKEND_DISPATCH,
                        "failed to pass data from client to facade",
                    ),
                    &request_id,
                )
                .await
            }
        }
    }

    fn is_auth_method(&self, method: &str) -> bool {
        self.auth_enabled && (method == METHOD_GENERATE_SECRET || method == METHOD_AUTHORIZE)
    }

    /// Forward to the auth backend with the channel id merged into params.
    /// A successful authorize stores the session and announces the device
    /// binding to the facade.
    async fn call_auth(&self, ctx: &ChannelContext, request: &Envelope) -> GateResult<Value> {
        let params = merge_channel_id(request.params.clone(), &ctx.channel_id);
        let response = self
            .bus
            .call(&self.auth_service, &request.method, params)
            .await?;

        if request.method == METHOD_AUTHORIZE {
            // Only an object result is a session; the auth backend signals
            // failure with null/false results as well as error responses.
            if let Some(session) = response.get("result").filter(|r| r.is_object()) {
                info!(channel_id = %ctx.channel_id, "channel authorized");
                self.sessions
                    .write()
                    .await
                    .insert(ctx.channel_id.clone(), session.clone());
                self.announce_device_switch(ctx, session.clone());
            }
        }

        Ok(response)
    }

    /// Fire-and-forget device-binding announcement; failures are only logged.
    fn announce_device_switch(&self, ctx: &ChannelContext, session: Value) {
        let bus = self.bus.clone();
        let facade = self.facade_service.clone();
        let channel_id = ctx.channel_id.clone();
        let params = json!({ "auth": session, "clientInfo": ctx.client_info });
        tokio::spawn(async move {
            if let Err(e) = bus
                .call(&facade, "registration.onboardingDeviceSwitched", params)
                .await
            {
                warn!(channel_id = %channel_id, error = %e, "onboardingDeviceSwitched call failed");
            }
        });
    }

    /// Forward to the facade wrapped in the translation envelope.
    async fn call_facade(&self, ctx: &ChannelContext, request: &Envelope) -> GateResult<Value> {
        let translate = self.translate(ctx, request).await;
        self.bus
            .call(&self.facade_service, &request.method, translate)
            .await
    }

    /// The enriched request shape sent to the facade: current session (or
    /// empty object when anonymous), client metadata, and routing
    /// correlation data alongside the original params.
    async fn translate(&self, ctx: &ChannelContext, request: &Envelope) -> Value {
        let auth = self
            .sessions
            .read()
            .await
            .get(&ctx.channel_id)
            .cloned()
            .unwrap_or_else(|| json!({}));
        json!({
            "_frontendGate": true,
            "auth": auth,
            "clientInfo": ctx.client_info,
            "routing": {
                "requestId": request.id,
                "channelId": ctx.channel_id,
            },
            "meta": {
                "clientRequestIp": ctx.client_ip,
            },
            "params": request.params.clone().unwrap_or_else(|| json!({})),
        })
    }

    /// Authenticated → Anonymous teardown shared by logout, close, and
    /// error. If a user was bound, the facade is told the channel went
    /// offline before the session is forgotten.
    async fn client_offline(&self, channel_id: &str) -> GateResult<()> {
        self.pipes.write().await.remove(channel_id);
        let session = self.sessions.write().await.remove(channel_id);

        let user_id = session
            .as_ref()
            .and_then(|s| s.get("userId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(user) = user_id {
            info!(channel_id = %channel_id, user = %user, "notifying facade about offline user");
            self.bus
                .call(
                    &self.facade_service,
                    "offline",
                    json!({ "channelId": channel_id, "user": user }),
                )
                .await?;
        }
        Ok(())
    }

    // ── Inbound surface, registered on the bus ─────────────────────────

    /// `transfer` — push a frame to a live channel on behalf of a backend.
    ///
    /// Fails with [`GateError::ChannelNotFound`] when the channel has no
    /// reply binding, and with [`GateError::Notify`] when the write itself
    /// fails. Returns an acknowledgment on success.
    pub async fn transfer(&self, params: TransferParams) -> GateResult<Value> {
        let sink = self.pipes.read().await.get(&params.channel_id).cloned();
        let Some(sink) = sink else {
            return Err(GateError::ChannelNotFound(params.channel_id));
        };

        let mut frame = Map::new();
        frame.insert("id".into(), Value::String(NOTIFY_ID.into()));
        frame.insert("method".into(), Value::String(params.method));
        if let Some(error) = params.error {
            frame.insert("error".into(), error);
        } else {
            frame.insert("result".into(), Value::Object(params.data));
        }

        sink.send(Value::Object(frame), &Value::Null)
            .await
            .map_err(|e| GateError::Notify(e.to_string()))?;
        Ok(json!({ "status": "OK" }))
    }

    /// `checkChannel` — is this channel currently connected?
    pub async fn check_channel(&self, params: CheckChannelParams) -> Value {
        let connected = self.pipes.read().await.contains_key(&params.channel_id);
        json!({ "isConnected": connected })
    }

    /// `checkChannels` — filter a list of channel ids down to the connected
    /// subset, preserving input order. Read-only.
    pub async fn check_channels(&self, params: CheckChannelsParams) -> Value {
        let pipes = self.pipes.read().await;
        let connected: Vec<&String> = params
            .channels_ids
            .iter()
            .filter(|id| pipes.contains_key(id.as_str()))
            .collect();
        json!({ "connected": connected })
    }
}

/// Merge `channelId` into the request params for auth backend calls.
fn merge_channel_id(params: Option<Value>, channel_id: &str) -> Value {
    let mut map = match params {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    map.insert("channelId".into(), Value::String(channel_id.to_string()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::{ConnectionRegistry, Outbound};
    use async_trait::async_trait;
    use gate_core::ClientInfo;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted bus: pops one canned response per call and records the
    /// calls it saw.
    struct MockBus {
        responses: Mutex<VecDeque<GateResult<Value>>>,
        calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl MockBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script(&self, response: GateResult<Value>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusClient for MockBus {
        async fn call(&self, service: &str, method: &str, params: Value) -> GateResult<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((service.to_string(), method.to_string(), params));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "result": {} })))
        }
    }

    fn test_config(auth_enabled: bool) -> GateConfig {
        GateConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ping_interval_secs: 30,
            auth_enabled,
            bus_url: String::new(),
            auth_service: "auth".into(),
            facade_service: "facade".into(),
            gate_prefix: "gate".into(),
        }
    }

    struct Fixture {
        bus: Arc<MockBus>,
        router: Arc<SessionRouter>,
        registry: Arc<ConnectionRegistry>,
    }

    fn fixture(auth_enabled: bool) -> Fixture {
        let bus = MockBus::new();
        let router = Arc::new(SessionRouter::new(bus.clone(), &test_config(auth_enabled)));
        let registry = Arc::new(ConnectionRegistry::new());
        Fixture {
            bus,
            router,
            registry,
        }
    }

    fn ctx(id: &str) -> ChannelContext {
        ChannelContext {
            channel_id: id.to_string(),
            client_ip: "198.51.100.7".to_string(),
            client_info: ClientInfo {
                platform: Some("web".into()),
                ..Default::default()
            },
        }
    }

    /// Register a live fake connection and return its sink + frame receiver.
    async fn connect(fx: &Fixture, id: &str) -> (ReplySink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        fx.registry.register(ctx(id), tx).await;
        (ReplySink::new(id.to_string(), fx.registry.clone()), rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_pushes_sign_secret() {
        let fx = fixture(true);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.bus.script(Ok(json!({ "result": { "secret": "s3cr3t" } })));

        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        let calls = fx.bus.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "auth");
        assert_eq!(calls[0].1, "auth.generateSecret");
        assert_eq!(calls[0].2, json!({ "channelId": "c1" }));

        let frame = next_frame(&mut rx);
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], json!("sign"));
        assert_eq!(frame["params"], json!({ "secret": "s3cr3t" }));
    }

    #[tokio::test]
    async fn test_open_with_auth_disabled_is_quiet() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;

        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        assert!(fx.bus.calls().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_id_mirrors_regardless_of_backend() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        // Backend answers with its own internal id; the client must still
        // see the request id.
        fx.bus
            .script(Ok(json!({ "id": 991, "result": { "ok": true } })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": "7", "method": "content.feed", "params": { "a": 1 } }),
                &sink,
            )
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame, json!({ "id": "7", "result": { "ok": true } }));
    }

    #[tokio::test]
    async fn test_translation_envelope_shape() {
        let fx = fixture(false);
        let (sink, _rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 3, "method": "content.feed", "params": { "limit": 20 } }),
                &sink,
            )
            .await
            .unwrap();

        let calls = fx.bus.calls();
        assert_eq!(calls[0].0, "facade");
        assert_eq!(calls[0].1, "content.feed");
        let translate = &calls[0].2;
        assert_eq!(translate["_frontendGate"], json!(true));
        assert_eq!(translate["auth"], json!({}));
        assert_eq!(translate["clientInfo"], json!({ "platform": "web" }));
        assert_eq!(
            translate["routing"],
            json!({ "requestId": 3, "channelId": "c1" })
        );
        assert_eq!(translate["meta"], json!({ "clientRequestIp": "198.51.100.7" }));
        assert_eq!(translate["params"], json!({ "limit": 20 }));
    }

    #[tokio::test]
    async fn test_authorize_stores_session_then_logout_clears_it() {
        let fx = fixture(true);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.bus.script(Ok(json!({ "result": { "secret": "s" } })));
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();
        let _sign = next_frame(&mut rx);

        // authorize succeeds and binds a user.
        fx.bus
            .script(Ok(json!({ "result": { "userId": "u1", "role": "member" } })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 1, "method": "auth.authorize", "params": { "sig": "x" } }),
                &sink,
            )
            .await
            .unwrap();
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], json!(1));
        assert_eq!(frame["result"]["userId"], json!("u1"));

        // Auth params were merged with the channel id.
        let authorize_call = &fx.bus.calls()[1];
        assert_eq!(authorize_call.0, "auth");
        assert_eq!(
            authorize_call.2,
            json!({ "sig": "x", "channelId": "c1" })
        );

        // Subsequent facade call carries the stored session.
        fx.bus.script(Ok(json!({ "result": {} })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 2, "method": "content.feed" }),
                &sink,
            )
            .await
            .unwrap();
        let _ = next_frame(&mut rx);
        let facade_call = fx
            .bus
            .calls()
            .into_iter()
            .find(|(_, m, _)| m == "content.feed")
            .unwrap();
        assert_eq!(facade_call.2["auth"]["userId"], json!("u1"));

        // Logout: no reply frame, session gone, offline sent to facade.
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 3, "method": "auth.logout" }),
                &sink,
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "logout must not emit a response");
        let offline_call = fx
            .bus
            .calls()
            .into_iter()
            .find(|(_, m, _)| m == "offline")
            .unwrap();
        assert_eq!(
            offline_call.2,
            json!({ "channelId": "c1", "user": "u1" })
        );

        // After logout the channel is anonymous again.
        fx.bus.script(Ok(json!({ "result": {} })));
        let (sink2, mut rx2) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink2)
            .await
            .ok();
        let _ = rx2.try_recv();
        fx.bus.script(Ok(json!({ "result": {} })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 4, "method": "content.feed" }),
                &sink2,
            )
            .await
            .unwrap();
        let anon_call = fx.bus.calls().into_iter().last().unwrap();
        assert_eq!(anon_call.2["auth"], json!({}));
    }

    #[tokio::test]
    async fn test_authorize_failure_leaves_channel_anonymous() {
        let fx = fixture(true);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.bus.script(Ok(json!({ "result": { "secret": "s" } })));
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();
        let _ = next_frame(&mut rx);

        // Failure response is passed through verbatim (plus the mirrored id).
        fx.bus
            .script(Ok(json!({ "error": { "code": 401, "message": "bad signature" } })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 1, "method": "auth.authorize" }),
                &sink,
            )
            .await
            .unwrap();
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], json!(1));
        assert_eq!(frame["error"]["code"], json!(401));

        // Teardown finds no session, so no offline call goes out.
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Close, &sink)
            .await
            .unwrap();
        assert!(fx.bus.calls().iter().all(|(_, m, _)| m != "offline"));
    }

    #[tokio::test]
    async fn test_authorize_non_object_result_stores_no_session() {
        let fx = fixture(true);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.bus.script(Ok(json!({ "result": { "secret": "s" } })));
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();
        let _ = next_frame(&mut rx);

        // A falsy result is a rejection, not a session.
        for rejected in [json!(false), json!(""), json!(0)] {
            fx.bus.script(Ok(json!({ "result": rejected })));
            fx.router
                .handle_request(
                    &ctx("c1"),
                    json!({ "id": 1, "method": "auth.authorize" }),
                    &sink,
                )
                .await
                .unwrap();
            let _ = next_frame(&mut rx);
        }

        // No session stored: the next facade call is anonymous and close
        // triggers no offline notification.
        fx.bus.script(Ok(json!({ "result": {} })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 2, "method": "content.feed" }),
                &sink,
            )
            .await
            .unwrap();
        let facade_call = fx.bus.calls().into_iter().last().unwrap();
        assert_eq!(facade_call.2["auth"], json!({}));

        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Close, &sink)
            .await
            .unwrap();
        assert!(fx.bus.calls().iter().all(|(_, m, _)| m != "offline"));
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_generic_error() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        fx.bus.script(Err(GateError::Bus("facade timed out".into())));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": "9", "method": "content.feed" }),
                &sink,
            )
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], json!("9"));
        assert_eq!(frame["error"]["code"], json!(codes::BACKEND_DISPATCH));
        // Internal detail never leaks to the client.
        assert!(!frame["error"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_request_echoed_back() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        fx.router
            .handle_request(&ctx("c1"), json!({ "id": 5, "params": {} }), &sink)
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], json!(5));
        assert_eq!(frame["error"]["code"], json!(codes::INVALID_REQUEST));
        assert!(fx.bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auth_methods_fall_through_when_disabled() {
        let fx = fixture(false);
        let (sink, _rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        fx.bus.script(Ok(json!({ "result": {} })));
        fx.router
            .handle_request(
                &ctx("c1"),
                json!({ "id": 1, "method": "auth.generateSecret" }),
                &sink,
            )
            .await
            .unwrap();

        // With auth disabled the request is ordinary facade dispatch.
        let calls = fx.bus.calls();
        assert_eq!(calls[0].0, "facade");
        assert_eq!(calls[0].2["_frontendGate"], json!(true));
    }

    #[tokio::test]
    async fn test_transfer_to_live_and_unknown_channel() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        let mut data = Map::new();
        data.insert("unread".into(), json!(4));
        let ack = fx
            .router
            .transfer(TransferParams {
                channel_id: "c1".into(),
                method: "notifications.changed".into(),
                data,
                error: None,
            })
            .await
            .unwrap();
        assert_eq!(ack, json!({ "status": "OK" }));

        let frame = next_frame(&mut rx);
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], json!("notifications.changed"));
        assert_eq!(frame["result"], json!({ "unread": 4 }));
        assert!(rx.try_recv().is_err(), "exactly one push frame");

        let err = fx
            .router
            .transfer(TransferParams {
                channel_id: "never-seen".into(),
                method: "m".into(),
                data: Map::new(),
                error: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_transfer_error_payload() {
        let fx = fixture(false);
        let (sink, mut rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();

        fx.router
            .transfer(TransferParams {
                channel_id: "c1".into(),
                method: "job.failed".into(),
                data: Map::new(),
                error: Some(json!({ "code": 500, "message": "boom" })),
            })
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame["error"]["code"], json!(500));
        assert!(frame.get("result").is_none());
    }

    #[tokio::test]
    async fn test_check_channels_preserves_order_and_state() {
        let fx = fixture(false);
        for id in ["a", "b", "c"] {
            let (sink, _rx) = connect(&fx, id).await;
            fx.router
                .handle_event(&ctx(id), ChannelEvent::Open, &sink)
                .await
                .unwrap();
        }

        let result = fx
            .router
            .check_channels(CheckChannelsParams {
                channels_ids: vec![
                    "c".into(),
                    "ghost".into(),
                    "a".into(),
                    "b".into(),
                    "other".into(),
                ],
            })
            .await;
        assert_eq!(result, json!({ "connected": ["c", "a", "b"] }));

        // Read-only: a second identical query sees the same state.
        let again = fx
            .router
            .check_channels(CheckChannelsParams {
                channels_ids: vec!["c".into(), "a".into(), "b".into()],
            })
            .await;
        assert_eq!(again, json!({ "connected": ["c", "a", "b"] }));

        let single = fx
            .router
            .check_channel(CheckChannelParams {
                channel_id: "ghost".into(),
            })
            .await;
        assert_eq!(single, json!({ "isConnected": false }));
    }

    #[tokio::test]
    async fn test_close_without_session_is_silent() {
        let fx = fixture(false);
        let (sink, _rx) = connect(&fx, "c1").await;
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Open, &sink)
            .await
            .unwrap();
        fx.router
            .handle_event(&ctx("c1"), ChannelEvent::Close, &sink)
            .await
            .unwrap();
        assert!(fx.bus.calls().is_empty());

        // The reply binding is gone: transfer now fails.
        let err = fx
            .router
            .transfer(TransferParams {
                channel_id: "c1".into(),
                method: "m".into(),
                data: Map::new(),
                error: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::ChannelNotFound(_)));
    }
}
