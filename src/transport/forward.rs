//! Per-session forward table.
//!
//! Maps device ports to the local ports bridging them. Each entry owns its
//! bridge and its port reservation, so removing an entry (explicitly, at
//! session teardown, or by drop) releases both.
//!
//! ```text
//! ┌──────────────── ForwardTable (device ABC123) ─────────────────┐
//! │  device:8100  →  localhost:20417   (bridge + reservation)     │
//! │  device:9100  →  localhost:21302   (bridge + reservation)     │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, DeviceLink, ForwardBridge};
use crate::error::{Error, Result};

use super::ports::{PortAllocator, PortReservation};

// ============================================================================
// ForwardEntry
// ============================================================================

/// One active local → device bridge.
pub struct ForwardEntry {
    device_port: u16,
    bridge: Option<Box<dyn ForwardBridge>>,
    reservation: PortReservation,
}

impl ForwardEntry {
    /// Returns the device-resident port.
    #[inline]
    #[must_use]
    pub const fn device_port(&self) -> u16 {
        self.device_port
    }

    /// Returns the local loopback port.
    #[inline]
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.reservation.port()
    }

    /// Closes the bridge. The port reservation is released on drop.
    fn close(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            if let Err(e) = bridge.close() {
                error!(
                    device_port = self.device_port,
                    local_port = self.local_port(),
                    error = %e,
                    "Failed to close forward"
                );
            } else {
                debug!(
                    device_port = self.device_port,
                    local_port = self.local_port(),
                    "Forward closed"
                );
            }
        }
    }
}

impl Drop for ForwardEntry {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ForwardEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardEntry")
            .field("device_port", &self.device_port)
            .field("local_port", &self.local_port())
            .field("open", &self.bridge.is_some())
            .finish()
    }
}

// ============================================================================
// GateLease
// ============================================================================

type Gates = Mutex<FxHashMap<u16, Arc<tokio::sync::Mutex<()>>>>;

/// A caller's hold on the gate of one device port. The last holder removes
/// the gate from the map.
struct GateLease<'a> {
    gates: &'a Gates,
    device_port: u16,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> GateLease<'a> {
    fn acquire(gates: &'a Gates, device_port: u16) -> Self {
        let gate = Arc::clone(gates.lock().entry(device_port).or_default());
        Self {
            gates,
            device_port,
            gate,
        }
    }
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock();
        // Waiters clone under the same lock, so a count of two (map plus
        // this lease) means nobody else is queued.
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.device_port);
        }
    }
}

// ============================================================================
// ForwardTable
// ============================================================================

/// Active forwards of one device session.
///
/// Creating a forward for a device port that is already forwarded returns the
/// existing local port. Creations for different device ports run
/// concurrently; only the port allocation itself is globally serialized.
pub struct ForwardTable {
    device: DeviceHandle,
    link: Arc<dyn DeviceLink>,
    allocator: PortAllocator,
    /// Established forwards by device port.
    entries: Mutex<FxHashMap<u16, ForwardEntry>>,
    /// One async gate per device port so concurrent requests for the same
    /// port open a single bridge.
    gates: Gates,
    /// Set by `close_all`; no forward is created afterwards.
    closed: AtomicBool,
}

impl ForwardTable {
    /// Creates an empty table for the device.
    #[must_use]
    pub fn new(device: DeviceHandle, link: Arc<dyn DeviceLink>, allocator: PortAllocator) -> Self {
        Self {
            device,
            link,
            allocator,
            entries: Mutex::new(FxHashMap::default()),
            gates: Mutex::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Forwards `device_port` to a local port and returns the local port.
    ///
    /// Idempotent per device port. A `preferred_local_port` of 0 allocates one.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the table was closed
    /// - [`Error::ResourceExhausted`] / [`Error::PortInUse`] from allocation
    /// - Any error from [`DeviceLink::open_forward`]
    pub async fn create_forward(&self, device_port: u16, preferred_local_port: u16) -> Result<u16> {
        if let Some(local_port) = self.local_port(device_port) {
            return Ok(local_port);
        }

        let lease = GateLease::acquire(&self.gates, device_port);
        let _guard = lease.gate.lock().await;

        // Another caller may have finished while we waited on the gate.
        if let Some(local_port) = self.local_port(device_port) {
            return Ok(local_port);
        }
        self.ensure_open()?;

        let reservation = self.allocator.allocate(preferred_local_port)?;
        let local_port = reservation.port();

        let bridge = match self
            .link
            .open_forward(&self.device, device_port, local_port)
            .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                error!(
                    device_id = %self.device.id,
                    device_port,
                    local_port,
                    error = %e,
                    "Failed to forward port"
                );
                return Err(e);
            }
        };

        let entry = ForwardEntry {
            device_port,
            bridge: Some(bridge),
            reservation,
        };

        {
            let mut entries = self.entries.lock();
            // Checked under the entries lock so close_all cannot miss it.
            if self.closed.load(Ordering::SeqCst) {
                drop(entries);
                drop(entry);
                return Err(Error::cancelled(format!(
                    "forward to device port {device_port} on closed session {}",
                    self.device.id
                )));
            }
            entries.insert(device_port, entry);
        }

        info!(
            device_id = %self.device.id,
            device_port,
            local_port,
            "Forward established"
        );
        Ok(local_port)
    }

    /// Closes the forward for `device_port`.
    ///
    /// Returns `false` if no such forward exists.
    pub fn close_forward(&self, device_port: u16) -> bool {
        let removed = self.entries.lock().remove(&device_port);
        removed.is_some()
    }

    /// Closes every forward and refuses new ones.
    ///
    /// Safe to call more than once and after partial failures.
    pub fn close_all(&self) {
        let drained: Vec<ForwardEntry> = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::SeqCst);
            entries.drain().map(|(_, entry)| entry).collect()
        };

        if !drained.is_empty() {
            debug!(
                device_id = %self.device.id,
                count = drained.len(),
                "Closing all forwards"
            );
        }
        drop(drained);
    }

    /// Returns the local port forwarding `device_port`, if any.
    #[inline]
    #[must_use]
    pub fn local_port(&self, device_port: u16) -> Option<u16> {
        self.entries.lock().get(&device_port).map(ForwardEntry::local_port)
    }

    /// Returns all forwards as `device_port → local_port`.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u16, u16> {
        self.entries
            .lock()
            .iter()
            .map(|(device_port, entry)| (*device_port, entry.local_port()))
            .collect()
    }

    /// Returns the number of active forwards.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no forward is active.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once `close_all` has run.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            warn!(device_id = %self.device.id, "Forward requested on closed session");
            return Err(Error::cancelled(format!(
                "session {} is closed",
                self.device.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ForwardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardTable")
            .field("device_id", &self.device.id)
            .field("forwards", &self.snapshot())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
