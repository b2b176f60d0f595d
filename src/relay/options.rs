//! Relay timing, port and route configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use device_relay::RelayOptions;
//!
//! let options = RelayOptions::new()
//!     .with_settle_delay(Duration::from_secs(1))
//!     .with_exponential_backoff()
//!     .with_agent_ports(8100, 9100);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::transport::ports::{DEFAULT_BASE_PORT, DEFAULT_MAX_PROBES, DEFAULT_MAX_STEP};

// ============================================================================
// Constants
// ============================================================================

/// Grace period between attach and first use of the device.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Delay before resubscribing after a notification failure.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Ceiling for exponential resubscription backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-attempt health check timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between two health checks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// Agent control (WebDriver) port on the device.
pub const DEFAULT_CONTROL_PORT: u16 = 8100;

/// Agent media stream port on the device.
pub const DEFAULT_MEDIA_PORT: u16 = 9100;

/// Proxy prefix for the control port.
pub const DEFAULT_CONTROL_PREFIX: &str = "/wda";

/// Proxy prefix for the media port.
pub const DEFAULT_MEDIA_PREFIX: &str = "/wdavideo";

/// Agent health endpoint.
pub const DEFAULT_HEALTH_PATH: &str = "/status";

// ============================================================================
// RelayOptions
// ============================================================================

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Wait after an attach notification before resolving the device.
    pub settle_delay: Duration,

    /// Initial resubscription delay.
    pub backoff: Duration,

    /// Upper bound for exponential backoff.
    pub max_backoff: Duration,

    /// Double the backoff after each consecutive failure.
    pub exponential_backoff: bool,

    /// Per-attempt health check timeout.
    pub health_timeout: Duration,

    /// Delay between health checks.
    pub health_interval: Duration,

    /// Agent control port on the device.
    pub control_port: u16,

    /// Agent media port on the device.
    pub media_port: u16,

    /// Route prefix for the control port.
    pub control_prefix: String,

    /// Route prefix for the media port.
    pub media_prefix: String,

    /// Health endpoint path on the control port.
    pub health_path: String,

    /// First port of the allocator's scan range.
    pub base_port: u16,

    /// Ports probed before allocation gives up.
    pub max_probes: u32,

    /// Largest random step between probes.
    pub max_step: u16,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl RelayOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            backoff: DEFAULT_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            exponential_backoff: false,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            control_port: DEFAULT_CONTROL_PORT,
            media_port: DEFAULT_MEDIA_PORT,
            control_prefix: DEFAULT_CONTROL_PREFIX.to_string(),
            media_prefix: DEFAULT_MEDIA_PREFIX.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            base_port: DEFAULT_BASE_PORT,
            max_probes: DEFAULT_MAX_PROBES,
            max_step: DEFAULT_MAX_STEP,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl RelayOptions {
    /// Sets the post-attach settle delay.
    #[inline]
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the initial and maximum resubscription backoff.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Enables exponential backoff.
    #[inline]
    #[must_use]
    pub fn with_exponential_backoff(mut self) -> Self {
        self.exponential_backoff = true;
        self
    }

    /// Sets the per-attempt health check timeout.
    #[inline]
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Sets the delay between health checks.
    #[inline]
    #[must_use]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Sets the agent's control and media ports.
    #[inline]
    #[must_use]
    pub fn with_agent_ports(mut self, control: u16, media: u16) -> Self {
        self.control_port = control;
        self.media_port = media;
        self
    }

    /// Sets the proxy prefixes for the control and media routes.
    #[inline]
    #[must_use]
    pub fn with_route_prefixes(
        mut self,
        control: impl Into<String>,
        media: impl Into<String>,
    ) -> Self {
        self.control_prefix = control.into();
        self.media_prefix = media.into();
        self
    }

    /// Sets the health endpoint path.
    #[inline]
    #[must_use]
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Sets the port allocator's scan parameters.
    #[inline]
    #[must_use]
    pub fn with_port_scan(mut self, base_port: u16, max_probes: u32, max_step: u16) -> Self {
        self.base_port = base_port;
        self.max_probes = max_probes;
        self.max_step = max_step;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl RelayOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff.is_zero() {
            return Err("Backoff must be greater than zero".to_string());
        }
        if self.max_backoff < self.backoff {
            return Err("Maximum backoff must not be below the initial backoff".to_string());
        }
        if self.health_timeout.is_zero() || self.health_interval.is_zero() {
            return Err("Health check timeout and interval must be greater than zero".to_string());
        }
        if self.control_port == 0 || self.media_port == 0 {
            return Err("Agent ports must be nonzero".to_string());
        }
        if self.control_port == self.media_port {
            return Err("Agent control and media ports must differ".to_string());
        }
        for prefix in [&self.control_prefix, &self.media_prefix, &self.health_path] {
            if !prefix.starts_with('/') {
                return Err(format!("Path must start with '/': {prefix}"));
            }
        }
        if self.control_prefix == self.media_prefix {
            return Err("Control and media route prefixes must differ".to_string());
        }
        if self.base_port == 0 || self.max_probes == 0 || self.max_step == 0 {
            return Err("Port scan base, probe count and step must be nonzero".to_string());
        }
        Ok(())
    }

    /// Returns the `(prefix, device_port)` pairs installed when the agent is ready.
    #[must_use]
    pub fn agent_routes(&self) -> [(&str, u16); 2] {
        [
            (self.control_prefix.as_str(), self.control_port),
            (self.media_prefix.as_str(), self.media_port),
        ]
    }
}

// ============================================================================
// Tests
// ============================================================================
