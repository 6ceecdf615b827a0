//! gate-core: Shared protocol library for the frontend gate.
//!
//! Provides the JSON-RPC wire envelope and its serialization rules
//! (request-id mirroring, sentinel-id omission for server pushes),
//! the error taxonomy with client-visible codes, and the accept-time
//! client metadata model.

pub mod client_info;
pub mod envelope;
pub mod error;

// Re-export commonly used items at crate root.
pub use client_info::ClientInfo;
pub use envelope::{Envelope, NOTIFY_ID};
pub use error::{codes, GateError, GateResult};
