//! Gateway module — connection acceptance, liveness, and framing.
//!
//! The gateway is composed of two cooperating submodules:
//!
//! - **[`registry`]** — the live connection set: channel id → outbound
//!   sender, liveness flag, and accept-time client metadata. Hands out
//!   [`ReplySink`](registry::ReplySink) capabilities so nothing outside
//!   the listener ever touches a transport handle.
//!
//! - **[`listener`]** — the [`GateListener`]: binds the WebSocket
//!   endpoint, assigns a fresh channel id per accepted connection, pumps
//!   frames in a per-connection select loop, runs the two-strike liveness
//!   sweep, and forwards decoded requests and lifecycle events to the
//!   session router.

pub mod listener;
pub mod registry;

pub use listener::GateListener;
pub use registry::{ConnectionRegistry, ReplySink};

use gate_core::ClientInfo;

/// Lifecycle events derived from transport state. Not wire messages:
/// the listener synthesizes them and the router consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error,
}

/// Identity and metadata accompanying every event and request forwarded
/// to the router. The channel id is the only key that crosses the
/// listener/router boundary.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel_id: String,
    pub client_ip: String,
    pub client_info: ClientInfo,
}
