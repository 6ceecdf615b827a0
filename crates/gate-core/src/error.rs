use thiserror::Error;

/// Errors produced by the gate protocol and routing layers.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("notify error: {0}")]
    Notify(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;

/// Client-visible RPC error codes.
///
/// The values are stable: backends and clients match on them.
pub mod codes {
    /// A backend call failed while dispatching a client request.
    pub const BACKEND_DISPATCH: i64 = 1104;
    /// `transfer` addressed a channel that is not connected.
    pub const CHANNEL_NOT_FOUND: i64 = 1105;
    /// Writing a push frame to a live channel failed.
    pub const NOTIFY_FATAL: i64 = 1106;
    /// Internal failure while producing a response for the client.
    pub const INTERNAL_RESPONSE: i64 = 1107;
    /// Internal failure while serializing an outbound frame.
    pub const INTERNAL_SERIALIZE: i64 = 1108;

    /// JSON-RPC: structurally invalid request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// JSON-RPC: unknown route.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// JSON-RPC: parameters failed structural validation.
    pub const INVALID_PARAMS: i64 = -32602;
}
