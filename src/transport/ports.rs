//! Local port allocation.
//!
//! Every forward needs a loopback port. Ports are shared by all sessions in
//! the process, so allocation goes through one [`PortAllocator`] whose lock
//! covers both the bind probe and the reservation. Two concurrent callers can
//! therefore never be handed the same port before either has bound it.
//!
//! # Example
//!
//! ```ignore
//! let allocator = PortAllocator::new();
//! let reservation = allocator.allocate(0)?;
//! println!("forward on localhost:{}", reservation.port());
//! // Port returns to the pool when `reservation` is dropped.
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// First port considered when scanning.
pub const DEFAULT_BASE_PORT: u16 = 20000;

/// Number of ports probed before giving up.
pub const DEFAULT_MAX_PROBES: u32 = 64;

/// Upper bound of the random step between two probes.
pub const DEFAULT_MAX_STEP: u16 = 1000;

// ============================================================================
// PortAllocator
// ============================================================================

/// Process-wide allocator of loopback ports.
///
/// Cheap to clone; clones share the reserved set.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<AllocatorInner>,
}

struct AllocatorInner {
    /// Ports handed out and not yet released.
    reserved: Mutex<FxHashSet<u16>>,
    base_port: u16,
    max_probes: u32,
    max_step: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("base_port", &self.inner.base_port)
            .field("max_probes", &self.inner.max_probes)
            .field("reserved", &self.reserved_count())
            .finish()
    }
}

impl PortAllocator {
    /// Creates an allocator with default scan settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_BASE_PORT, DEFAULT_MAX_PROBES, DEFAULT_MAX_STEP)
    }

    /// Creates an allocator scanning from `base_port`.
    ///
    /// `max_step` is clamped to at least 1.
    #[must_use]
    pub fn with_settings(base_port: u16, max_probes: u32, max_step: u16) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                reserved: Mutex::new(FxHashSet::default()),
                base_port: base_port.max(1),
                max_probes,
                max_step: max_step.max(1),
            }),
        }
    }

    /// Reserves a local port.
    ///
    /// With `preferred == 0` the scan starts at the base port plus a random
    /// offset and moves by random steps, wrapping inside `base..=65535`. A
    /// nonzero `preferred` is taken as-is without probing.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceExhausted`] if no free port was found
    /// - [`Error::PortInUse`] if `preferred` is already reserved
    pub fn allocate(&self, preferred: u16) -> Result<PortReservation> {
        let mut reserved = self.inner.reserved.lock();

        if preferred != 0 {
            if !reserved.insert(preferred) {
                return Err(Error::port_in_use(preferred));
            }
            debug!(port = preferred, "Reserved preferred local port");
            return Ok(self.reservation(preferred));
        }

        let mut rng = rand::thread_rng();
        let span = 65536 - u32::from(self.inner.base_port);
        let mut offset = rng.gen_range(0..u32::from(self.inner.max_step)) % span;

        for attempt in 0..self.inner.max_probes {
            // offset < span, so the sum stays within u16
            let candidate = (u32::from(self.inner.base_port) + offset) as u16;

            if !reserved.contains(&candidate) && probe_free(candidate) {
                reserved.insert(candidate);
                debug!(port = candidate, attempt, "Allocated local port");
                return Ok(self.reservation(candidate));
            }

            trace!(port = candidate, "Port busy, probing next");
            offset = (offset + rng.gen_range(1..=u32::from(self.inner.max_step))) % span;
        }

        warn!(
            probes = self.inner.max_probes,
            reserved = reserved.len(),
            "Local port space exhausted"
        );
        Err(Error::resource_exhausted(self.inner.max_probes))
    }

    /// Returns `true` if the port is currently handed out.
    #[inline]
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.inner.reserved.lock().contains(&port)
    }

    /// Returns the number of ports currently handed out.
    #[inline]
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.inner.reserved.lock().len()
    }

    fn reservation(&self, port: u16) -> PortReservation {
        PortReservation {
            port,
            allocator: Arc::clone(&self.inner),
        }
    }
}

/// Binds and immediately releases the port on loopback.
fn probe_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

// ============================================================================
// PortReservation
// ============================================================================

/// A port held out of the shared pool.
///
/// The port is released when the reservation drops.
pub struct PortReservation {
    port: u16,
    allocator: Arc<AllocatorInner>,
}

impl PortReservation {
    /// Returns the reserved port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortReservation").field(&self.port).finish()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.allocator.reserved.lock().remove(&self.port);
        trace!(port = self.port, "Released local port");
    }
}

// ============================================================================
// Port Parsing
// ============================================================================

/// Parses a decimal port number from a request path segment.
///
/// # Errors
///
/// Returns [`Error::InvalidPort`] if the input is not a number in `0..=65535`.
pub fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::invalid_port(value))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn test_allocate_returns_port_in_range() {
        let allocator = PortAllocator::new();
        let reservation = allocator.allocate(0).expect("allocate");
        assert!(reservation.port() >= DEFAULT_BASE_PORT);
        assert!(allocator.is_reserved(reservation.port()));
    }

    #[test]
    fn test_drop_releases_port() {
        let allocator = PortAllocator::new();
        let port = {
            let reservation = allocator.allocate(0).expect("allocate");
            reservation.port()
        };
        assert!(!allocator.is_reserved(port));
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn test_preferred_port_taken_as_is() {
        let allocator = PortAllocator::new();
        let reservation = allocator.allocate(8100).expect("allocate");
        assert_eq!(reservation.port(), 8100);
    }

    #[test]
    fn test_preferred_port_cannot_be_reserved_twice() {
        let allocator = PortAllocator::new();
        let _held = allocator.allocate(8100).expect("allocate");
        let err = allocator.allocate(8100).unwrap_err();
        assert!(matches!(err, Error::PortInUse { port: 8100 }));
    }

    #[test]
    fn test_bound_port_is_skipped() {
        // Every probe lands on the same, externally bound port.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let busy = listener.local_addr().expect("addr").port();

        let allocator = PortAllocator::with_settings(busy, 4, 1);
        // max_step 1 means the first candidate is `busy`, then busy+1, ...
        let reservation = allocator.allocate(0).expect("allocate");
        assert_ne!(reservation.port(), busy);
    }

    #[test]
    fn test_exhaustion_reports_probe_count() {
        // A span of one port: once it is reserved nothing else is left.
        let allocator = PortAllocator::with_settings(65535, 3, 1);
        let _last = allocator.allocate(65535).expect("allocate");

        let err = allocator.allocate(0).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { attempts: 3 }));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let allocator = PortAllocator::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate(0).expect("allocate"))
            })
            .collect();

        let reservations: Vec<PortReservation> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        let ports: HashSet<u16> = reservations.iter().map(PortReservation::port).collect();

        assert_eq!(ports.len(), reservations.len());
        assert_eq!(allocator.reserved_count(), reservations.len());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("8100").expect("valid"), 8100);
        assert_eq!(parse_port("0").expect("valid"), 0);
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(matches!(parse_port("abc"), Err(Error::InvalidPort { .. })));
    }
}
