//! Per-device sessions and the registry that holds them.
//!
//! A session exists exactly while its device is attached. It owns the
//! device's forward table, the agent bootstrap state and the proxy routes
//! installed once the agent is healthy.
//!
//! # Agent States
//!
//! ```text
//! NotStarted ─► Launching ─► Polling ─► Ready
//!      │            │           │         │
//!      └────────────┴───────────┴─────────┴──► Failed
//! ```
//!
//! Failed is terminal for the lifetime of the session.

// ============================================================================
// Submodules
// ============================================================================

/// Session registry.
pub mod registry;

/// Session and agent state.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use registry::SessionRegistry;
pub use state::{AgentState, ProxyRoute, Session, SessionSummary};
