//! Local port allocation and device port forwarding.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   allocate    ┌──────────────────┐
//! │  ForwardTable    │──────────────►│  PortAllocator   │  (one per process)
//! │  (one per device)│               └──────────────────┘
//! │                  │  open_forward ┌──────────────────┐
//! │                  │──────────────►│  DeviceLink      │──► device:PORT
//! └──────────────────┘               └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `ports` | Loopback port allocator and reservations |
//! | `forward` | Per-session forward table |

// ============================================================================
// Submodules
// ============================================================================

/// Per-session forward table.
pub mod forward;

/// Loopback port allocation.
pub mod ports;

// ============================================================================
// Re-exports
// ============================================================================

pub use forward::{ForwardEntry, ForwardTable};
pub use ports::{PortAllocator, PortReservation, parse_port};
