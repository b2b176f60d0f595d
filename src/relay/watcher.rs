//! Device attach/detach loop.
//!
//! ```text
//!        start / error
//!   ┌──────────────────────┐
//!   ▼                      │
//! Disconnected ─► Connecting ─► Listening
//!                                  │
//!                                  └─ notification error ─► Disconnected
//! ```
//!
//! The loop only ends on relay shutdown. Notifications are handled one at a
//! time in arrival order; agent bootstraps run as separate tasks.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::device::DeviceEvent;
use crate::identifiers::DeviceId;
use crate::session::Session;
use crate::transport::ForwardTable;

use super::bootstrap::AgentBootstrap;
use super::core::RelayInner;

// ============================================================================
// WatcherState
// ============================================================================

/// Subscription state of the device watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatcherState {
    /// Not subscribed; waiting to retry.
    #[default]
    Disconnected,
    /// Subscription requested.
    Connecting,
    /// Receiving notifications.
    Listening,
    /// Relay shut down.
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Resubscription delay policy.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    exponential: bool,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, exponential: bool) -> Self {
        Self {
            initial,
            max,
            exponential,
            current: initial,
        }
    }

    /// Returns the delay to wait now and advances the policy.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.exponential {
            self.current = self.current.saturating_mul(2).min(self.max);
        }
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// DeviceWatcher
// ============================================================================

/// Long-running notification loop driving the session registry.
pub(crate) struct DeviceWatcher {
    inner: Arc<RelayInner>,
    backoff: Backoff,
}

impl DeviceWatcher {
    pub(crate) fn new(inner: Arc<RelayInner>) -> Self {
        let options = &inner.options;
        let backoff = Backoff::new(
            options.backoff,
            options.max_backoff,
            options.exponential_backoff,
        );
        Self { inner, backoff }
    }

    /// Runs until the relay shuts down.
    pub(crate) async fn run(mut self) {
        let shutdown = self.inner.shutdown.clone();

        'watch: loop {
            self.set_state(WatcherState::Connecting);

            let subscribed = tokio::select! {
                biased;
                () = shutdown.cancelled() => break 'watch,
                result = self.inner.link.subscribe() => result,
            };

            match subscribed {
                Ok(mut events) => {
                    self.backoff.reset();
                    self.set_state(WatcherState::Listening);
                    info!("Listening for device notifications");

                    loop {
                        let next = tokio::select! {
                            biased;
                            () = shutdown.cancelled() => break 'watch,
                            next = events.next() => next,
                        };

                        match next {
                            Some(Ok(event)) => self.handle_event(event).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "Device notification stream failed");
                                break;
                            }
                            None => {
                                warn!("Device notification stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Device subscription failed");
                }
            }

            self.set_state(WatcherState::Disconnected);
            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis(), "Resubscribing after backoff");

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break 'watch,
                () = sleep(delay) => {}
            }
        }

        self.set_state(WatcherState::Stopped);
        info!("Device watcher stopped");
    }

    fn set_state(&self, state: WatcherState) {
        *self.inner.watcher_state.write() = state;
    }

    async fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(id) => self.on_attached(id).await,
            DeviceEvent::Detached(id) => self.on_detached(&id),
        }
    }

    async fn on_attached(&self, id: DeviceId) {
        info!(device_id = %id, "Device attached");

        if !self.inner.options.settle_delay.is_zero() {
            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => return,
                () = sleep(self.inner.options.settle_delay) => {}
            }
        }

        let resolved = tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => return,
            resolved = self.inner.link.resolve_device(&id) => resolved,
        };
        let device = match resolved {
            Ok(device) => device,
            Err(e) => {
                warn!(device_id = %id, error = %e, "Device lookup failed");
                return;
            }
        };

        let forwards = ForwardTable::new(
            device.clone(),
            Arc::clone(&self.inner.link),
            self.inner.allocator.clone(),
        );
        let cancel = self.inner.shutdown.child_token();
        let session = Arc::new(Session::new(device, forwards, cancel));

        // The previous session is torn down before its successor becomes
        // visible.
        let previous = self
            .inner
            .registry
            .replace_or_insert(Arc::clone(&session), Session::teardown);
        if previous.is_some() {
            debug!(device_id = %id, "Replaced existing session");
        }

        let bootstrap = AgentBootstrap::new(Arc::clone(&self.inner), session);
        self.inner.tasks.spawn(bootstrap.run());
    }

    fn on_detached(&self, id: &DeviceId) {
        match self.inner.registry.remove(id) {
            Some(session) => {
                session.teardown();
                info!(device_id = %id, "Device detached");
            }
            None => debug!(device_id = %id, "Detach for unknown device"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
