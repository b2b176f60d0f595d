//! On-device agent bootstrap.
//!
//! One task per attached device:
//!
//! 1. **Launching**: request the agent launch, then forward its control and
//!    media ports.
//! 2. **Polling**: `GET http://localhost:<control>/status` until it answers
//!    200. There is no attempt ceiling; polling ends only when the agent
//!    exits, its control forward is closed or the session is removed.
//! 3. **Ready**: install both proxy routes, then watch for the agent exiting,
//!    which drops the routes again.
//!
//! Every wait races the session's cancellation token, and agent exit wins
//! over a concurrent health check success.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::device::AgentProcess;
use crate::error::Result;
use crate::session::{AgentState, Session};

use super::core::RelayInner;

// ============================================================================
// Types
// ============================================================================

/// How a wait inside the bootstrap ended early.
enum Interrupt {
    /// Session removed.
    Cancelled,
    /// Agent stopped or lost its control forward; carries the reason.
    Failed(String),
}

// ============================================================================
// AgentBootstrap
// ============================================================================

/// Agent state machine for one session.
pub(crate) struct AgentBootstrap {
    inner: Arc<RelayInner>,
    session: Arc<Session>,
}

impl AgentBootstrap {
    pub(crate) fn new(inner: Arc<RelayInner>, session: Arc<Session>) -> Self {
        Self { inner, session }
    }

    /// Drives the agent from launch to Ready, then watches it until it exits
    /// or the session is removed.
    pub(crate) async fn run(self) {
        let device_id = self.session.id().clone();

        let Some(mut process) = self.launch().await else {
            return;
        };

        if !self.open_agent_forwards().await {
            process.stop();
            return;
        }

        if !self.session.advance(AgentState::Polling) {
            process.stop();
            return;
        }

        match self.poll_until_healthy(&mut process).await {
            Ok(()) => {}
            Err(Interrupt::Cancelled) => {
                debug!(device_id = %device_id, "Bootstrap cancelled while polling");
                process.stop();
                return;
            }
            Err(Interrupt::Failed(reason)) => {
                self.session.fail(reason);
                process.stop();
                return;
            }
        }

        let routes = self.inner.options.agent_routes();
        if !self.session.mark_ready(&routes) {
            if !self.session.is_cancelled() {
                self.session.fail("agent forwards closed before ready");
            }
            debug!(device_id = %device_id, "Session left Polling before Ready");
            process.stop();
            return;
        }

        let cancel = self.session.cancel_token().clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(device_id = %device_id, "Session removed, stopping agent");
                process.stop();
            }
            exit = process.wait(&device_id) => {
                let reason = exit_reason(exit);
                warn!(device_id = %device_id, reason = %reason, "Agent exited after Ready");
                self.session.fail(reason);
            }
        }
    }

    /// NotStarted → Launching and the launch request itself.
    async fn launch(&self) -> Option<AgentProcess> {
        if !self.session.advance(AgentState::Launching) {
            return None;
        }

        let device = self.session.device();
        let cancel = self.session.cancel_token();
        info!(device_id = %device.id, bundle_id = %self.inner.agent.bundle_id, "Launching agent");

        let launched = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            launched = self.inner.link.launch_agent(device, &self.inner.agent) => launched,
        };

        match launched {
            Ok(process) => {
                if cancel.is_cancelled() {
                    process.stop();
                    return None;
                }
                Some(process)
            }
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "Agent launch failed");
                self.session.fail(e.to_string());
                None
            }
        }
    }

    /// Forwards the control and media ports. On failure the session is
    /// marked Failed and the other forward released.
    async fn open_agent_forwards(&self) -> bool {
        let options = &self.inner.options;
        let forwards = self.session.forwards();
        let device_id = self.session.id();

        let control = forwards.create_forward(options.control_port, 0).await;
        let media = match &control {
            Ok(_) => forwards.create_forward(options.media_port, 0).await,
            Err(_) => Ok(0),
        };

        match (control, media) {
            (Ok(control_local), Ok(media_local)) => {
                debug!(
                    device_id = %device_id,
                    control_local,
                    media_local,
                    "Agent forwards established"
                );
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                forwards.close_forward(options.control_port);
                forwards.close_forward(options.media_port);
                if !self.session.is_cancelled() {
                    warn!(device_id = %device_id, error = %e, "Agent forward failed");
                    self.session.fail(e.to_string());
                }
                false
            }
        }
    }

    /// Polls the health endpoint until it answers 200.
    async fn poll_until_healthy(
        &self,
        process: &mut AgentProcess,
    ) -> std::result::Result<(), Interrupt> {
        let device_id = self.session.id();
        let cancel = self.session.cancel_token();
        let interval = self.inner.options.health_interval;
        let control_port = self.inner.options.control_port;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            let Some(control_local) = self.session.forwards().local_port(control_port) else {
                return Err(Interrupt::Failed(format!(
                    "forward to agent port {control_port} closed"
                )));
            };

            let healthy = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Interrupt::Cancelled),
                exit = process.wait(device_id) => return Err(Interrupt::Failed(exit_reason(exit))),
                healthy = self.check_health(control_local) => healthy,
            };

            if healthy {
                // An exit that raced the successful check wins.
                if let Some(exit) = process.try_exit(device_id) {
                    return Err(Interrupt::Failed(exit_reason(exit)));
                }
                info!(device_id = %device_id, attempts, "Agent health check passed");
                return Ok(());
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Interrupt::Cancelled),
                exit = process.wait(device_id) => return Err(Interrupt::Failed(exit_reason(exit))),
                () = sleep(interval) => {}
            }
        }
    }

    /// One health check against the control forward at `local_port`.
    async fn check_health(&self, local_port: u16) -> bool {
        let options = &self.inner.options;
        let url = format!("http://localhost:{local_port}{}", options.health_path);

        match self
            .inner
            .http
            .get(&url)
            .timeout(options.health_timeout)
            .send()
            .await
        {
            Ok(response) => {
                trace!(url = %url, status = %response.status(), "Health check");
                response.status() == StatusCode::OK
            }
            Err(e) => {
                trace!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}

/// Failure reason recorded for an agent that stopped.
fn exit_reason(exit: Result<()>) -> String {
    match exit {
        Ok(()) => "agent exited".to_string(),
        Err(e) => e.to_string(),
    }
}
