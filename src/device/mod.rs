//! Device-communication collaborator.
//!
//! The relay never speaks the device's native transport. Everything it needs
//! from the device stack goes through the [`DeviceLink`] trait:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`DeviceLink::subscribe`] | Stream of attach/detach notifications |
//! | [`DeviceLink::resolve_device`] | Full metadata for an attached device |
//! | [`DeviceLink::open_forward`] | Bridge a local port to a device port |
//! | [`DeviceLink::launch_agent`] | Start the on-device automation agent |
//!
//! Implementations wrap a usbmux/RSD client; tests use an in-crate fake.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

#[cfg(test)]
pub(crate) mod fake;

// ============================================================================
// Constants
// ============================================================================

/// Bundle id of the WebDriverAgent runner app.
pub const DEFAULT_AGENT_BUNDLE_ID: &str = "com.facebook.WebDriverAgentRunner.QAQ.xctrunner";

/// XCTest configuration the runner executes.
pub const DEFAULT_XCTEST_CONFIG: &str = "WebDriverAgentRunner.xctest";

// ============================================================================
// DeviceEvent
// ============================================================================

/// Attach/detach notification from the device stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device became reachable.
    Attached(DeviceId),
    /// Device went away.
    Detached(DeviceId),
}

impl DeviceEvent {
    /// Returns the device the event refers to.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Attached(id) | Self::Detached(id) => id,
        }
    }
}

/// Notification stream returned by [`DeviceLink::subscribe`].
///
/// An `Err` item or the end of the stream means the subscription is dead.
pub type DeviceEventStream = Pin<Box<dyn Stream<Item = Result<DeviceEvent>> + Send>>;

// ============================================================================
// DeviceHandle
// ============================================================================

/// Resolved device metadata.
///
/// Owned by the session while the device is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHandle {
    /// Device serial.
    pub id: DeviceId,
    /// User-visible device name.
    pub name: Option<String>,
    /// Hardware model (e.g. `iPhone14,2`).
    pub product_type: Option<String>,
    /// OS version.
    pub product_version: Option<String>,
}

impl DeviceHandle {
    /// Creates a handle with no metadata beyond the serial.
    #[inline]
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: None,
            product_type: None,
            product_version: None,
        }
    }

    /// Sets the device name.
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the hardware model.
    #[inline]
    #[must_use]
    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    /// Sets the OS version.
    #[inline]
    #[must_use]
    pub fn with_product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into());
        self
    }
}

// ============================================================================
// ForwardBridge
// ============================================================================

/// A live local-port → device-port bridge.
///
/// Closing must be idempotent.
pub trait ForwardBridge: Send + Sync {
    /// Stops accepting local connections and tears the bridge down.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying listener fails to close.
    fn close(&mut self) -> Result<()>;
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Launch parameters for the on-device automation agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Bundle id of the app hosting the test.
    pub bundle_id: String,
    /// Bundle id of the XCTest runner.
    pub test_runner_bundle_id: String,
    /// XCTest configuration name.
    pub xctest_config: String,
    /// Environment passed to the test process.
    pub env: BTreeMap<String, String>,
    /// Arguments passed to the test process.
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bundle_id: DEFAULT_AGENT_BUNDLE_ID.to_string(),
            test_runner_bundle_id: DEFAULT_AGENT_BUNDLE_ID.to_string(),
            xctest_config: DEFAULT_XCTEST_CONFIG.to_string(),
            env: BTreeMap::new(),
            args: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Sets both the app and runner bundle ids.
    #[inline]
    #[must_use]
    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        let bundle_id = bundle_id.into();
        self.test_runner_bundle_id.clone_from(&bundle_id);
        self.bundle_id = bundle_id;
        self
    }

    /// Sets the XCTest configuration name.
    #[inline]
    #[must_use]
    pub fn with_xctest_config(mut self, name: impl Into<String>) -> Self {
        self.xctest_config = name.into();
        self
    }

    /// Adds an environment variable.
    #[inline]
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds an argument.
    #[inline]
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

// ============================================================================
// AgentProcess
// ============================================================================

/// Outcome reported when the agent stops: `Err` carries the device stack's
/// error message.
pub type AgentOutcome = std::result::Result<(), String>;

/// Relay-side handle to a launched agent.
///
/// The agent runs independently of the bootstrap; its end is observed through
/// [`AgentProcess::wait`].
pub struct AgentProcess {
    /// Resolves when the agent stops.
    exit: oneshot::Receiver<AgentOutcome>,
    /// Asks the device stack to stop the agent.
    stop: CancellationToken,
}

/// Device-stack side of an [`AgentProcess`].
///
/// The [`DeviceLink`] implementation reports the agent's end through it and
/// watches [`AgentReporter::stop_requested`] to kill the agent.
pub struct AgentReporter {
    exit: oneshot::Sender<AgentOutcome>,
    stop: CancellationToken,
}

impl AgentProcess {
    /// Creates a connected process handle and reporter pair.
    #[must_use]
    pub fn channel() -> (Self, AgentReporter) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let stop = CancellationToken::new();
        (
            Self {
                exit: exit_rx,
                stop: stop.clone(),
            },
            AgentReporter {
                exit: exit_tx,
                stop,
            },
        )
    }

    /// Waits until the agent stops.
    ///
    /// A reporter dropped without reporting counts as a clean exit.
    /// Must not be polled again once it has returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AgentLaunchFailed`] if the agent reported an error.
    pub async fn wait(&mut self, device_id: &DeviceId) -> Result<()> {
        match (&mut self.exit).await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(message)) => Err(Error::agent_launch_failed(device_id.clone(), message)),
        }
    }

    /// Returns the agent's outcome if it has already stopped.
    ///
    /// Once this returns `Some`, neither it nor [`wait`](Self::wait) may be
    /// called again.
    pub fn try_exit(&mut self, device_id: &DeviceId) -> Option<Result<()>> {
        match self.exit.try_recv() {
            Ok(Ok(())) | Err(oneshot::error::TryRecvError::Closed) => Some(Ok(())),
            Ok(Err(message)) => Some(Err(Error::agent_launch_failed(device_id.clone(), message))),
            Err(oneshot::error::TryRecvError::Empty) => None,
        }
    }

    /// Requests the agent to stop.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            debug!("Agent stop requested");
            self.stop.cancel();
        }
    }
}

impl AgentReporter {
    /// Reports that the agent stopped.
    pub fn exited(self, outcome: AgentOutcome) {
        let _ = self.exit.send(outcome);
    }

    /// Returns a token cancelled when the relay wants the agent stopped.
    #[inline]
    #[must_use]
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProcess")
            .field("stop_requested", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// DeviceLink
// ============================================================================

/// Operations the relay consumes from the device-communication library.
#[async_trait]
pub trait DeviceLink: Send + Sync + 'static {
    /// Subscribes to attach/detach notifications.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the device multiplexer is unreachable.
    async fn subscribe(&self) -> Result<DeviceEventStream>;

    /// Resolves full metadata for an attached device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    async fn resolve_device(&self, id: &DeviceId) -> Result<DeviceHandle>;

    /// Bridges `localhost:local_port` to `device_port` on the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forward`] or [`Error::Io`] if the bridge cannot be
    /// established.
    async fn open_forward(
        &self,
        device: &DeviceHandle,
        device_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardBridge>>;

    /// Starts the automation agent on the device.
    ///
    /// Returns as soon as the launch is requested; the agent's end is
    /// delivered through the returned [`AgentProcess`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AgentLaunchFailed`] if the launch request itself fails.
    async fn launch_agent(
        &self,
        device: &DeviceHandle,
        config: &AgentConfig,
    ) -> Result<AgentProcess>;
}

// ============================================================================
// Tests
// ============================================================================
