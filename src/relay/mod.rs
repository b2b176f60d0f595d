//! Relay coordinator, device watcher and agent bootstrap.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Relay`] | Session API for the HTTP layer |
//! | [`RelayBuilder`] | Fluent configuration builder |
//! | [`RelayOptions`] | Timing, port and route options |
//! | [`WatcherState`] | Subscription state of the device watcher |
//!
//! # Tasks
//!
//! ```text
//! Relay::start ─► DeviceWatcher (one task)
//!                    │ Attached
//!                    └─► AgentBootstrap (one task per session)
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Agent launch, health polling and route installation.
mod bootstrap;

/// Fluent builder pattern for relay configuration.
pub mod builder;

/// Core relay implementation.
pub mod core;

/// Relay options.
pub mod options;

/// Device attach/detach loop.
pub mod watcher;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::RelayBuilder;
pub use core::Relay;
pub use options::RelayOptions;
pub use watcher::WatcherState;
