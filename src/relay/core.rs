//! Relay coordinator and the API the HTTP layer calls into.
//!
//! The [`Relay`] owns the session registry, the process-wide port allocator
//! and the device watcher task. HTTP handlers look sessions up per request
//! and must tolerate them disappearing concurrently.
//!
//! # Example
//!
//! ```ignore
//! use device_relay::{DeviceId, Relay};
//!
//! let relay = Relay::builder().link(link).build()?;
//! relay.start();
//!
//! let id = DeviceId::new("00008030-001A2B3C4D5E");
//! let ports = relay.create_forwards(&id, &[8100, 9100]).await?;
//! let wda = relay.route_for(&id, "/wda");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::device::{AgentConfig, DeviceLink};
use crate::error::{Error, Result};
use crate::identifiers::DeviceId;
use crate::protocol::IntrospectionClient;
use crate::session::{Session, SessionRegistry, SessionSummary};
use crate::transport::PortAllocator;

use super::builder::RelayBuilder;
use super::options::RelayOptions;
use super::watcher::{DeviceWatcher, WatcherState};

// ============================================================================
// Types
// ============================================================================

/// Shared state of the relay, its watcher and bootstrap tasks.
pub(crate) struct RelayInner {
    /// Device-communication collaborator.
    pub link: Arc<dyn DeviceLink>,

    /// Live sessions by device id.
    pub registry: SessionRegistry,

    /// Process-wide local port allocator.
    pub allocator: PortAllocator,

    /// Timing, port and route options.
    pub options: RelayOptions,

    /// Agent launch parameters.
    pub agent: AgentConfig,

    /// Health check client.
    pub http: reqwest::Client,

    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,

    /// Watcher and bootstrap tasks.
    pub tasks: TaskTracker,

    /// Current watcher state.
    pub watcher_state: RwLock<WatcherState>,

    /// Set once the watcher has been spawned.
    started: AtomicBool,
}

// ============================================================================
// Relay
// ============================================================================

/// Device session and port-forward coordinator.
#[derive(Clone)]
pub struct Relay {
    /// Shared inner state.
    pub(crate) inner: Arc<RelayInner>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("watcher_state", &self.watcher_state())
            .field("session_count", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Relay - Lifecycle
// ============================================================================

impl Relay {
    /// Creates a configuration builder for the relay.
    #[inline]
    #[must_use]
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    pub(crate) fn new(
        link: Arc<dyn DeviceLink>,
        options: RelayOptions,
        agent: AgentConfig,
    ) -> Result<Self> {
        // Health checks only ever target loopback forwards.
        let http = reqwest::Client::builder().no_proxy().build()?;
        let allocator =
            PortAllocator::with_settings(options.base_port, options.max_probes, options.max_step);

        let inner = Arc::new(RelayInner {
            link,
            registry: SessionRegistry::new(),
            allocator,
            options,
            agent,
            http,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            watcher_state: RwLock::new(WatcherState::Disconnected),
            started: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Spawns the device watcher. Later calls do nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let watcher = DeviceWatcher::new(Arc::clone(&self.inner));
        self.inner.tasks.spawn(watcher.run());
        info!("Relay started");
    }

    /// Returns the device watcher's state.
    #[inline]
    #[must_use]
    pub fn watcher_state(&self) -> WatcherState {
        *self.inner.watcher_state.read()
    }

    /// Stops the watcher, tears down every session and waits for all
    /// background tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let sessions = self.inner.registry.drain();
        info!(count = sessions.len(), "Shutting down relay");
        for session in sessions {
            session.teardown();
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        // An attach that was mid-flight may have inserted a session.
        for session in self.inner.registry.drain() {
            session.teardown();
        }
        *self.inner.watcher_state.write() = WatcherState::Stopped;
    }
}

// ============================================================================
// Relay - Session API
// ============================================================================

impl Relay {
    /// Lists every attached device, ordered by id.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|session| session.summary())
            .collect()
    }

    /// Returns the live session for `id`.
    #[inline]
    #[must_use]
    pub fn session(&self, id: &DeviceId) -> Option<Arc<Session>> {
        self.inner.registry.get(id)
    }

    fn require_session(&self, id: &DeviceId) -> Result<Arc<Session>> {
        self.session(id)
            .ok_or_else(|| Error::session_not_found(id.clone()))
    }

    /// Returns the local port forwarded to `device_port`, creating the
    /// forward if needed.
    ///
    /// Works regardless of the agent's state.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if the device is not attached
    /// - [`Error::ResourceExhausted`] if no local port is free
    /// - [`Error::Forward`] if the device refuses the bridge
    /// - [`Error::Cancelled`] if the session is removed meanwhile
    pub async fn get_forward(&self, id: &DeviceId, device_port: u16) -> Result<u16> {
        let session = self.require_session(id)?;
        session.forwards().create_forward(device_port, 0).await
    }

    /// Ensures forwards for every `device_port` and returns the session's
    /// full `device_port → local_port` map.
    ///
    /// Ports are opened concurrently. A port that fails is logged and left
    /// out of the map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the device is not attached.
    pub async fn create_forwards(
        &self,
        id: &DeviceId,
        device_ports: &[u16],
    ) -> Result<BTreeMap<u16, u16>> {
        let session = self.require_session(id)?;
        let forwards = session.forwards();

        let results = join_all(
            device_ports
                .iter()
                .map(|&device_port| async move {
                    (device_port, forwards.create_forward(device_port, 0).await)
                }),
        )
        .await;

        for (device_port, result) in results {
            if let Err(e) = result {
                warn!(device_id = %id, device_port, error = %e, "Forward failed");
            }
        }

        Ok(forwards.snapshot())
    }

    /// Returns the session's active forwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the device is not attached.
    pub fn list_forwards(&self, id: &DeviceId) -> Result<BTreeMap<u16, u16>> {
        Ok(self.require_session(id)?.forwards().snapshot())
    }

    /// Closes one forward. Returns `false` if it did not exist.
    ///
    /// Closing the agent's control or media forward while it is Ready marks
    /// the agent Failed and drops its routes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the device is not attached.
    pub fn close_forward(&self, id: &DeviceId, device_port: u16) -> Result<bool> {
        Ok(self.require_session(id)?.close_forward(device_port))
    }

    /// Returns the local port behind a proxy route, if installed.
    #[must_use]
    pub fn route_for(&self, id: &DeviceId, path_prefix: &str) -> Option<u16> {
        self.session(id)?.route_for(path_prefix)
    }

    /// Maps an incoming request path to the agent URL it proxies to.
    ///
    /// Returns `None` if the device is not attached or no route matches.
    #[must_use]
    pub fn upstream_for(&self, id: &DeviceId, request_path: &str) -> Option<Url> {
        self.session(id)?.upstream_for(request_path)
    }

    /// Dumps the UI hierarchy from the introspection service on
    /// `device_port` and returns the `result` value.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if the device is not attached
    /// - forward errors from [`get_forward`](Self::get_forward)
    /// - [`Error::Protocol`] if the service is unreachable or replies badly
    pub async fn dump_hierarchy(&self, id: &DeviceId, device_port: u16) -> Result<Value> {
        let local_port = self.get_forward(id, device_port).await?;
        debug!(device_id = %id, device_port, local_port, "Dumping UI hierarchy");

        let client = IntrospectionClient::new(local_port);
        let response = client.dump().await;
        client.disconnect().await;

        match response? {
            Value::Object(mut object) => Ok(object.remove("result").unwrap_or(Value::Null)),
            other => Ok(other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use tokio_test::{assert_err, assert_ok};

    use crate::device::fake::{FakeAgentHttp, FakeDeviceLink, init_tracing, wait_until};
    use crate::protocol::{read_frame, write_frame};
    use crate::session::AgentState;

    fn fast_options() -> RelayOptions {
        RelayOptions::new()
            .with_settle_delay(Duration::ZERO)
            .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
            .with_health_interval(Duration::from_millis(20))
            .with_health_timeout(Duration::from_secs(2))
    }

    async fn started(link: &Arc<FakeDeviceLink>) -> Relay {
        init_tracing();
        let relay = Relay::builder()
            .link(Arc::clone(link) as Arc<dyn DeviceLink>)
            .options(fast_options())
            .build()
            .expect("build relay");
        relay.start();
        link.wait_for_subscriptions(1).await;
        relay
    }

    fn state_of(relay: &Relay, id: &DeviceId) -> Option<AgentState> {
        relay.session(id).map(|s| s.agent_state())
    }

    /// Attaches a marker device and waits for it, so every earlier
    /// notification has been handled.
    async fn flush(relay: &Relay, link: &FakeDeviceLink, marker: &str) {
        let id = DeviceId::new(marker);
        link.attach(marker);
        wait_until(|| relay.session(&id).is_some()).await;
    }

    #[tokio::test]
    async fn test_attach_reaches_ready_with_routes() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(200).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Ready)).await;

        let control = relay.route_for(&id, "/wda").expect("control route");
        let media = relay.route_for(&id, "/wdavideo").expect("media route");
        assert_ne!(control, media);
        assert_eq!(relay.get_forward(&id, 8100).await.expect("forward"), control);
        assert_eq!(relay.get_forward(&id, 9100).await.expect("forward"), media);
        assert!(agent.hits() >= 1);

        let sessions = relay.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ready);
        assert_eq!(sessions[0].routes.len(), 2);
        assert_eq!(link.launch_count(), 1);

        let upstream = relay.upstream_for(&id, "/wda/status").expect("upstream");
        assert_eq!(upstream.as_str(), format!("http://localhost:{control}/status"));
        let client = reqwest::Client::builder().no_proxy().build().expect("client");
        let status = client.get(upstream).send().await.expect("proxied status");
        assert_eq!(status.status(), reqwest::StatusCode::OK);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_agent_forward_ends_ready() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(200).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Ready)).await;

        assert!(assert_ok!(relay.close_forward(&id, 8100)));

        let summary = relay.list_sessions().remove(0);
        assert_eq!(summary.agent_state, AgentState::Failed);
        assert!(!summary.ready);
        assert!(summary.routes.is_empty());
        assert!(!summary.forwards.contains_key(&8100));
        assert_eq!(relay.route_for(&id, "/wda"), None);
        assert_eq!(relay.route_for(&id, "/wdavideo"), None);
        assert_eq!(relay.upstream_for(&id, "/wdavideo/stream"), None);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_control_forward_while_polling_fails() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(503).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| agent.hits() >= 1).await;

        assert!(assert_ok!(relay.close_forward(&id, 8100)));
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;

        let session = relay.session(&id).expect("session");
        assert!(session.failure().expect("reason").contains("8100"));
        assert!(link.agent_stop_requested("ABC123"));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_exit_racing_health_success_fails() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(503).await;
        agent.hold();
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| agent.hits() >= 1).await;
        assert_eq!(state_of(&relay, &id), Some(AgentState::Polling));

        // The held check answers 200 only after the agent has gone.
        agent.set_status(200);
        assert!(link.fail_agent("ABC123", "test runner crashed"));
        agent.release();

        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let session = relay.session(&id).expect("session");
        assert_eq!(session.agent_state(), AgentState::Failed);
        assert!(session.routes().is_empty());
        assert_eq!(relay.route_for(&id, "/wda"), None);
        assert!(link.agent_stop_requested("ABC123"));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_failure_before_ready_is_final() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(503).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| agent.hits() >= 2).await;
        assert_eq!(state_of(&relay, &id), Some(AgentState::Polling));

        assert!(link.fail_agent("ABC123", "test runner crashed"));
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;

        agent.set_status(200);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let session = relay.session(&id).expect("session");
        assert_eq!(session.agent_state(), AgentState::Failed);
        assert!(session.failure().expect("reason").contains("test runner crashed"));
        assert_eq!(relay.route_for(&id, "/wda"), None);
        assert!(link.agent_stop_requested("ABC123"));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_exit_after_ready_drops_routes() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(200).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Ready)).await;

        assert!(link.exit_agent("ABC123"));
        wait_until(|| relay.route_for(&id, "/wda").is_none()).await;

        assert_eq!(state_of(&relay, &id), Some(AgentState::Failed));
        assert!(relay.list_forwards(&id).expect("forwards").contains_key(&8100));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_during_polling_stops_health_checks() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(503).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| agent.hits() >= 2).await;
        let session = relay.session(&id).expect("session");

        link.detach("ABC123");
        wait_until(|| relay.session(&id).is_none()).await;
        assert!(session.is_cancelled());
        assert!(session.forwards().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let hits = agent.hits();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(agent.hits(), hits);
        assert!(link.agent_stop_requested("ABC123"));
        assert_ne!(session.agent_state(), AgentState::Ready);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_media_forward_failure_releases_control() {
        let link = FakeDeviceLink::new();
        link.fail_forwards_on(9100);
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;

        assert!(relay.list_forwards(&id).expect("forwards").is_empty());
        assert_eq!(link.opened_count(8100), 1);
        assert_eq!(link.closed_total(), 1);
        assert!(link.agent_stop_requested("ABC123"));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_arbitrary_forward_on_failed_session() {
        let link = FakeDeviceLink::new();
        link.fail_launch("developer image not mounted");
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;

        let local = relay.get_forward(&id, 5000).await.expect("forward");
        assert_eq!(relay.get_forward(&id, 5000).await.expect("forward"), local);
        assert_eq!(relay.route_for(&id, "/wda"), None);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_follows_last_notification() {
        let link = FakeDeviceLink::new();
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        for _ in 0..3 {
            link.attach("ABC123");
            link.detach("ABC123");
        }
        link.attach("ABC123");
        flush(&relay, &link, "MARKER-1").await;
        assert!(relay.session(&id).is_some());

        link.attach("ABC123");
        link.detach("ABC123");
        link.detach("ABC123");
        flush(&relay, &link, "MARKER-2").await;
        assert!(relay.session(&id).is_none());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_reattach_replaces_session() {
        let link = FakeDeviceLink::new();
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| relay.session(&id).is_some()).await;
        let first = relay.session(&id).expect("first");
        first.forwards().create_forward(5000, 0).await.expect("forward");

        link.attach("ABC123");
        wait_until(|| relay.session(&id).is_some_and(|s| !Arc::ptr_eq(&s, &first))).await;

        assert!(first.is_cancelled());
        assert!(first.forwards().is_empty());
        assert_eq!(relay.list_sessions().len(), 1);

        relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_defers_session() {
        let link = FakeDeviceLink::new();
        link.fail_launch("no agent");
        let relay = Relay::builder()
            .link(Arc::clone(&link) as Arc<dyn DeviceLink>)
            .options(fast_options().with_settle_delay(Duration::from_secs(3)))
            .build()
            .expect("build relay");
        relay.start();
        link.wait_for_subscriptions(1).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(relay.session(&id).is_none());
        assert_eq!(link.resolve_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(state_of(&relay, &id), Some(AgentState::Failed));

        relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_paces_resubscribes() {
        let link = FakeDeviceLink::new();
        link.fail_next_subscribes(2);
        let relay = Relay::builder()
            .link(Arc::clone(&link) as Arc<dyn DeviceLink>)
            .options(fast_options().with_backoff(Duration::from_secs(3), Duration::from_secs(30)))
            .build()
            .expect("build relay");
        relay.start();

        link.wait_for_subscriptions(1).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(link.subscribe_count(), 1);
        assert_eq!(relay.watcher_state(), WatcherState::Disconnected);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(link.subscribe_count(), 3);
        assert_eq!(relay.watcher_state(), WatcherState::Listening);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_unresolvable_device_is_skipped() {
        let link = FakeDeviceLink::new();
        link.fail_resolve("GHOST");
        let relay = started(&link).await;

        link.attach("GHOST");
        flush(&relay, &link, "MARKER").await;

        assert!(relay.session(&DeviceId::new("GHOST")).is_none());
        assert_eq!(relay.watcher_state(), WatcherState::Listening);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_error() {
        let link = FakeDeviceLink::new();
        let relay = started(&link).await;

        link.break_stream();
        link.wait_for_subscriptions(2).await;
        flush(&relay, &link, "MARKER").await;
        assert_eq!(relay.watcher_state(), WatcherState::Listening);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_failed_subscriptions() {
        let link = FakeDeviceLink::new();
        link.fail_next_subscribes(3);
        let relay = started(&link).await;

        link.wait_for_subscriptions(4).await;
        flush(&relay, &link, "MARKER").await;

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_forwards_returns_full_map() {
        let link = FakeDeviceLink::new();
        link.fail_launch("no agent");
        link.fail_forwards_on(7000);
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| state_of(&relay, &id) == Some(AgentState::Failed)).await;

        let ports = relay
            .create_forwards(&id, &[5000, 6000, 7000, 5000])
            .await
            .expect("forwards");
        assert_eq!(ports.keys().copied().collect::<Vec<_>>(), [5000, 6000]);
        assert_eq!(link.opened_count(5000), 1);

        assert!(relay.close_forward(&id, 5000).expect("close"));
        assert!(!relay.close_forward(&id, 5000).expect("close"));
        assert_eq!(relay.list_forwards(&id).expect("list").len(), 1);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let link = FakeDeviceLink::new();
        let relay = started(&link).await;
        let id = DeviceId::new("NOPE");

        assert!(matches!(
            relay.get_forward(&id, 8100).await,
            Err(Error::SessionNotFound { .. })
        ));
        assert_err!(relay.create_forwards(&id, &[8100]).await);
        assert_err!(relay.list_forwards(&id));
        assert_err!(relay.close_forward(&id, 8100));
        assert_eq!(relay.route_for(&id, "/wda"), None);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_dump_hierarchy() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let peer_addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.expect("accept");
            let _ = read_frame(&mut conn).await.expect("request");
            let reply = br#"{"id":"1","result":{"name":"Application","children":[]}}"#;
            write_frame(&mut conn, reply).await.expect("reply");
        });

        let link = FakeDeviceLink::new();
        link.fail_launch("no agent");
        link.route(8200, peer_addr);
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| relay.session(&id).is_some()).await;

        let tree = relay.dump_hierarchy(&id, 8200).await?;
        assert_eq!(tree, json!({"name": "Application", "children": []}));
        let forwards = assert_ok!(relay.list_forwards(&id));
        assert!(forwards.contains_key(&8200));

        relay.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_hanging_lookup() {
        let link = FakeDeviceLink::new();
        link.hang_resolve("ABC123");
        let relay = started(&link).await;

        link.attach("ABC123");
        wait_until(|| link.resolve_count() >= 1).await;

        assert_ok!(tokio::time::timeout(Duration::from_secs(2), relay.shutdown()).await);
        assert!(relay.list_sessions().is_empty());
        assert_eq!(relay.watcher_state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_tears_everything_down() {
        let link = FakeDeviceLink::new();
        let agent = FakeAgentHttp::start(503).await;
        link.route(8100, agent.addr());
        let relay = started(&link).await;
        let id = DeviceId::new("ABC123");

        link.attach("ABC123");
        wait_until(|| agent.hits() >= 1).await;
        let session = relay.session(&id).expect("session");

        relay.shutdown().await;

        assert!(relay.list_sessions().is_empty());
        assert!(session.is_cancelled());
        assert!(session.forwards().is_empty());
        assert_eq!(relay.watcher_state(), WatcherState::Stopped);
        assert_eq!(link.open_total(), link.closed_total());
    }
}
