//! Error types for the device relay.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use device_relay::{Error, Result};
//!
//! async fn example(relay: &Relay, id: &DeviceId) -> Result<()> {
//!     let local_port = relay.get_forward(id, 8100).await?;
//!     println!("agent reachable on localhost:{local_port}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidPort`] |
//! | Device link | [`Error::Transport`], [`Error::Forward`], [`Error::AgentLaunchFailed`] |
//! | Resources | [`Error::ResourceExhausted`], [`Error::PortInUse`] |
//! | Protocol | [`Error::Protocol`] |
//! | Sessions | [`Error::SessionNotFound`], [`Error::Cancelled`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Http`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::DeviceId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when relay configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Port value could not be parsed.
    #[error("Invalid port: {value}")]
    InvalidPort {
        /// The rejected input.
        value: String,
    },

    // ========================================================================
    // Device Link Errors
    // ========================================================================
    /// Device link lost or unusable.
    ///
    /// The device watcher resubscribes on this error; it is never fatal.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Port forward could not be established.
    #[error("Forward {local_port} -> device:{device_port} failed: {message}")]
    Forward {
        /// Device-resident port.
        device_port: u16,
        /// Local loopback port.
        local_port: u16,
        /// Description of the failure.
        message: String,
    },

    /// On-device agent failed to launch or exited.
    #[error("Agent launch failed on {device_id}: {message}")]
    AgentLaunchFailed {
        /// Device the agent was launched on.
        device_id: DeviceId,
        /// Error reported by the device link.
        message: String,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// No free local port was found.
    #[error("No free local port after {attempts} probes")]
    ResourceExhausted {
        /// Number of ports probed before giving up.
        attempts: u32,
    },

    /// Requested local port is already handed out to another forward.
    #[error("Local port {port} already reserved")]
    PortInUse {
        /// The contested port.
        port: u16,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or incomplete frame, missing result, or not connected.
    ///
    /// The connection may be unusable afterwards; callers should disconnect
    /// and reconnect.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// No live session for the device.
    #[error("Session not found: {device_id}")]
    SessionNotFound {
        /// The missing device.
        device_id: DeviceId,
    },

    /// Operation aborted because its session went away.
    #[error("Cancelled: {operation}")]
    Cancelled {
        /// Description of the cancelled operation.
        operation: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid port error.
    #[inline]
    pub fn invalid_port(value: impl Into<String>) -> Self {
        Self::InvalidPort {
            value: value.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a forward error.
    #[inline]
    pub fn forward(device_port: u16, local_port: u16, message: impl Into<String>) -> Self {
        Self::Forward {
            device_port,
            local_port,
            message: message.into(),
        }
    }

    /// Creates an agent launch failure.
    #[inline]
    pub fn agent_launch_failed(device_id: DeviceId, message: impl Into<String>) -> Self {
        Self::AgentLaunchFailed {
            device_id,
            message: message.into(),
        }
    }

    /// Creates a resource exhausted error.
    #[inline]
    pub fn resource_exhausted(attempts: u32) -> Self {
        Self::ResourceExhausted { attempts }
    }

    /// Creates a port in use error.
    #[inline]
    pub fn port_in_use(port: u16) -> Self {
        Self::PortInUse { port }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(device_id: DeviceId) -> Self {
        Self::SessionNotFound { device_id }
    }

    /// Creates a cancellation error.
    #[inline]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the device link itself failed.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns `true` if this is a protocol error.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ResourceExhausted { .. } | Self::Http(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
