//! Device Relay - session and port-forward orchestration for attached
//! mobile devices.
//!
//! This library exposes USB/network-attached devices as stable local ports
//! so automation clients can reach device-resident services without
//! speaking the device's native transport.
//!
//! # Architecture
//!
//! - **Watcher**: subscribes to attach/detach notifications and keeps one
//!   session per attached device
//! - **Forwards**: each session maps device ports to loopback ports drawn
//!   from one process-wide allocator
//! - **Bootstrap**: launches the on-device automation agent, polls its
//!   health endpoint and installs the `/wda` and `/wdavideo` proxy routes
//! - **Introspection**: a framed JSON-RPC client for the on-device UI
//!   introspection service
//!
//! The device stack itself is a collaborator behind the [`DeviceLink`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use device_relay::{DeviceId, Relay, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let relay = Relay::builder()
//!         .link(Arc::new(UsbmuxLink::connect().await?))
//!         .build()?;
//!     relay.start();
//!
//!     for session in relay.list_sessions() {
//!         println!("{} ready={}", session.id, session.ready);
//!     }
//!
//!     let id = DeviceId::new("00008030-001A2B3C4D5E");
//!     let local = relay.get_forward(&id, 8100).await?;
//!     println!("WebDriverAgent at http://localhost:{local}");
//!
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`device`] | Device collaborator trait and agent handles |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Framed JSON-RPC introspection client |
//! | [`relay`] | [`Relay`], watcher and agent bootstrap |
//! | [`session`] | Sessions, agent state and the registry |
//! | [`transport`] | Port allocation and forward tables |

// ============================================================================
// Modules
// ============================================================================

/// Device-communication collaborator.
///
/// Implement [`DeviceLink`] to plug in a device stack.
pub mod device;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Framed JSON-RPC protocol for the introspection service.
pub mod protocol;

/// Relay coordinator.
///
/// Use [`Relay::builder()`] to create a configured relay.
pub mod relay;

/// Per-device sessions.
pub mod session;

/// Local port allocation and device forwards.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Device types
pub use device::{
    AgentConfig, AgentOutcome, AgentProcess, AgentReporter, DeviceEvent, DeviceEventStream,
    DeviceHandle, DeviceLink, ForwardBridge,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{DeviceId, RequestId};

// Protocol types
pub use protocol::{IntrospectionClient, RpcRequest};

// Relay types
pub use relay::{Relay, RelayBuilder, RelayOptions, WatcherState};

// Session types
pub use session::{AgentState, ProxyRoute, Session, SessionRegistry, SessionSummary};

// Transport types
pub use transport::{ForwardTable, PortAllocator, PortReservation, parse_port};
