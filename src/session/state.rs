//! Live state of one attached device.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::identifiers::DeviceId;
use crate::transport::ForwardTable;

// ============================================================================
// AgentState
// ============================================================================

/// Bootstrap progress of the on-device agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    /// Bootstrap has not begun.
    #[default]
    NotStarted,
    /// Agent launch requested.
    Launching,
    /// Waiting for the health endpoint.
    Polling,
    /// Health check passed; proxy routes installed.
    Ready,
    /// Launch failed or the agent exited.
    Failed,
}

impl AgentState {
    /// Returns `true` if `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Launching)
                | (Self::Launching, Self::Polling)
                | (Self::Polling, Self::Ready)
                | (Self::NotStarted | Self::Launching | Self::Polling | Self::Ready, Self::Failed)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "notStarted",
            Self::Launching => "launching",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// ProxyRoute
// ============================================================================

/// Reverse-proxy route from a path prefix to a forwarded local port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    /// Path prefix, e.g. `/wda`.
    pub path_prefix: String,
    /// Local port the prefix proxies to.
    pub target_local_port: u16,
}

impl ProxyRoute {
    /// Maps the path remaining after the prefix to the upstream path.
    ///
    /// An empty remainder addresses the upstream root.
    #[must_use]
    pub fn upstream_path(suffix: &str) -> String {
        if suffix.is_empty() {
            "/".to_string()
        } else if suffix.starts_with('/') {
            suffix.to_string()
        } else {
            format!("/{suffix}")
        }
    }

    /// Builds the upstream URL for a request path remainder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the resulting URL is invalid.
    pub fn upstream_url(&self, suffix: &str) -> Result<Url> {
        let raw = format!(
            "http://localhost:{}{}",
            self.target_local_port,
            Self::upstream_path(suffix)
        );
        Url::parse(&raw).map_err(|e| Error::config(format!("invalid upstream URL {raw}: {e}")))
    }
}

/// A route as stored: the prefix and the device port it targets. The local
/// port is looked up in the forward table on every read.
#[derive(Debug, Clone)]
struct RouteBinding {
    path_prefix: String,
    device_port: u16,
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Default)]
struct AgentStatus {
    state: AgentState,
    routes: Vec<RouteBinding>,
    failure: Option<String>,
}

/// Live state of one attached device.
///
/// Owned by the session registry; readers get an `Arc` for the duration of a
/// request and must tolerate the session being torn down meanwhile.
pub struct Session {
    device: DeviceHandle,
    forwards: ForwardTable,
    agent: RwLock<AgentStatus>,
    /// Cancelled when the session is removed.
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session with no agent activity yet.
    #[must_use]
    pub fn new(device: DeviceHandle, forwards: ForwardTable, cancel: CancellationToken) -> Self {
        Self {
            device,
            forwards,
            agent: RwLock::new(AgentStatus::default()),
            cancel,
        }
    }

    /// Returns the device identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.device.id
    }

    /// Returns the resolved device metadata.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Returns the session's forward table.
    #[inline]
    #[must_use]
    pub fn forwards(&self) -> &ForwardTable {
        &self.forwards
    }

    /// Returns the cancellation scope of this session.
    #[inline]
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once the session has been removed.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the current agent state.
    #[inline]
    #[must_use]
    pub fn agent_state(&self) -> AgentState {
        self.agent.read().state
    }

    /// Returns why the agent failed, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.agent.read().failure.clone()
    }

    /// Moves the agent to `next` if the transition is legal.
    ///
    /// Refused on a removed session.
    pub fn advance(&self, next: AgentState) -> bool {
        let mut agent = self.agent.write();
        if self.is_cancelled() || !agent.state.can_transition_to(next) {
            return false;
        }
        debug!(device_id = %self.device.id, from = %agent.state, to = %next, "Agent state");
        agent.state = next;
        true
    }

    /// Moves Polling → Ready and installs the routes in one step.
    ///
    /// `routes` pairs each path prefix with a device port. Refused unless
    /// the agent is Polling, the session is live, and every device port is
    /// forwarded.
    pub fn mark_ready(&self, routes: &[(&str, u16)]) -> bool {
        let mut agent = self.agent.write();
        if self.is_cancelled() || agent.state != AgentState::Polling {
            return false;
        }
        if routes
            .iter()
            .any(|(_, device_port)| self.forwards.local_port(*device_port).is_none())
        {
            return false;
        }

        agent.routes = routes
            .iter()
            .map(|(prefix, device_port)| RouteBinding {
                path_prefix: (*prefix).to_string(),
                device_port: *device_port,
            })
            .collect();
        agent.state = AgentState::Ready;
        info!(device_id = %self.device.id, routes = agent.routes.len(), "Agent ready");
        true
    }

    /// Marks the agent Failed and drops its routes.
    ///
    /// Returns `false` if it had already failed.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let mut agent = self.agent.write();
        self.fail_locked(&mut agent, reason.into())
    }

    fn fail_locked(&self, agent: &mut AgentStatus, reason: String) -> bool {
        if !agent.state.can_transition_to(AgentState::Failed) {
            return false;
        }
        info!(device_id = %self.device.id, from = %agent.state, reason = %reason, "Agent failed");
        agent.state = AgentState::Failed;
        agent.routes.clear();
        agent.failure = Some(reason);
        true
    }

    /// Closes the forward for `device_port`. Returns `false` if it did not
    /// exist.
    ///
    /// A Ready agent loses both routes with it, so closing a routed forward
    /// fails the agent in the same step.
    pub fn close_forward(&self, device_port: u16) -> bool {
        let mut agent = self.agent.write();
        if agent
            .routes
            .iter()
            .any(|binding| binding.device_port == device_port)
        {
            self.fail_locked(
                &mut agent,
                format!("forward to agent port {device_port} closed"),
            );
        }
        self.forwards.close_forward(device_port)
    }

    /// Returns the installed routes with their current local ports.
    #[must_use]
    pub fn routes(&self) -> Vec<ProxyRoute> {
        self.agent
            .read()
            .routes
            .iter()
            .filter_map(|binding| {
                self.forwards
                    .local_port(binding.device_port)
                    .map(|target_local_port| ProxyRoute {
                        path_prefix: binding.path_prefix.clone(),
                        target_local_port,
                    })
            })
            .collect()
    }

    /// Resolves a request path against the installed routes and returns
    /// the upstream URL.
    ///
    /// Prefixes match whole path segments and the longest match wins, so
    /// `/wdavideo/stream` goes to `/wdavideo`, never `/wda`.
    #[must_use]
    pub fn upstream_for(&self, request_path: &str) -> Option<Url> {
        self.routes()
            .into_iter()
            .filter_map(|route| {
                let suffix = request_path.strip_prefix(route.path_prefix.as_str())?;
                (suffix.is_empty() || suffix.starts_with('/'))
                    .then(|| (route.path_prefix.len(), route, suffix.to_string()))
            })
            .max_by_key(|(len, _, _)| *len)
            .and_then(|(_, route, suffix)| route.upstream_url(&suffix).ok())
    }

    /// Returns the local port behind `path_prefix`, if routed.
    #[must_use]
    pub fn route_for(&self, path_prefix: &str) -> Option<u16> {
        let device_port = self
            .agent
            .read()
            .routes
            .iter()
            .find(|binding| binding.path_prefix == path_prefix)
            .map(|binding| binding.device_port)?;
        self.forwards.local_port(device_port)
    }

    /// Cancels in-flight work, drops routes and closes every forward.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.agent.write().routes.clear();
        self.forwards.close_all();
        debug!(device_id = %self.device.id, "Session torn down");
    }

    /// Returns a serializable snapshot.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let agent_state = self.agent_state();
        SessionSummary {
            id: self.device.id.clone(),
            name: self.device.name.clone(),
            product_type: self.device.product_type.clone(),
            product_version: self.device.product_version.clone(),
            agent_state,
            ready: agent_state == AgentState::Ready,
            failure: self.failure(),
            forwards: self.forwards.snapshot(),
            routes: self.routes(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.device.id)
            .field("agent_state", &self.agent_state())
            .field("forwards", &self.forwards.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// SessionSummary
// ============================================================================

/// Snapshot of a session for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Device serial.
    pub id: DeviceId,
    /// Device name.
    pub name: Option<String>,
    /// Hardware model.
    pub product_type: Option<String>,
    /// OS version.
    pub product_version: Option<String>,
    /// Agent bootstrap state.
    pub agent_state: AgentState,
    /// `true` when the agent is Ready.
    pub ready: bool,
    /// Why the agent failed, if it did.
    pub failure: Option<String>,
    /// Active forwards, `device_port → local_port`.
    pub forwards: BTreeMap<u16, u16>,
    /// Installed proxy routes.
    pub routes: Vec<ProxyRoute>,
}

// ============================================================================
// Tests
// ============================================================================
