//! Builder pattern for relay configuration.
//!
//! # Example
//!
//! ```ignore
//! use device_relay::Relay;
//!
//! let relay = Relay::builder()
//!     .link(usbmux_link)
//!     .build()?;
//! relay.start();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::device::{AgentConfig, DeviceLink};
use crate::error::{Error, Result};

use super::core::Relay;
use super::options::RelayOptions;

// ============================================================================
// RelayBuilder
// ============================================================================

/// Builder for configuring a [`Relay`].
///
/// Use [`Relay::builder()`] to create a new builder.
#[derive(Clone, Default)]
pub struct RelayBuilder {
    /// Device-communication collaborator.
    link: Option<Arc<dyn DeviceLink>>,
    /// Timing, port and route options.
    options: RelayOptions,
    /// Agent launch parameters.
    agent: AgentConfig,
}

impl fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("link", &self.link.is_some())
            .field("options", &self.options)
            .field("agent", &self.agent)
            .finish()
    }
}

// ============================================================================
// RelayBuilder Implementation
// ============================================================================

impl RelayBuilder {
    /// Creates a builder with default options and no device link.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the device-communication collaborator.
    #[inline]
    #[must_use]
    pub fn link(mut self, link: Arc<dyn DeviceLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Replaces the relay options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the agent launch parameters.
    #[inline]
    #[must_use]
    pub fn agent_config(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Builds the relay with validation. The watcher is not started.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no device link is set or the options are invalid
    /// - [`Error::Http`] if the health check client cannot be created
    pub fn build(self) -> Result<Relay> {
        let link = self.validate_link()?;
        self.options.validate().map_err(Error::config)?;
        self.validate_agent()?;

        Relay::new(link, self.options, self.agent)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl RelayBuilder {
    fn validate_link(&self) -> Result<Arc<dyn DeviceLink>> {
        self.link.clone().ok_or_else(|| {
            Error::config(
                "Device link is required. Use .link() to set it.\n\
                 Example: Relay::builder().link(Arc::new(UsbmuxLink::new()))",
            )
        })
    }

    fn validate_agent(&self) -> Result<()> {
        if self.agent.bundle_id.is_empty() || self.agent.test_runner_bundle_id.is_empty() {
            return Err(Error::config("Agent bundle id must not be empty"));
        }
        if self.agent.xctest_config.is_empty() {
            return Err(Error::config("Agent XCTest configuration must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
