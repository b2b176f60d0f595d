//! Framed JSON-RPC protocol for the on-device introspection service.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Body |
//! |---------|-----------|------|
//! | Request | Host → Device | `{"jsonrpc":"2.0","params":[..],"id":"<uuid>","method":"<name>"}` |
//! | Response | Device → Host | JSON object with a `result` key |
//!
//! Both directions use the same frame: a 4-byte little-endian length followed
//! by that many bytes of UTF-8 JSON.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Length-prefixed framing |
//! | `request` | Request body and result extraction |
//! | `client` | Connection with retry and request/response exchange |

// ============================================================================
// Submodules
// ============================================================================

/// Introspection socket client.
pub mod client;

/// Length-prefixed framing.
pub mod frame;

/// Request and response bodies.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::IntrospectionClient;
pub use frame::{read_frame, write_frame};
pub use request::{RpcRequest, extract_result};
