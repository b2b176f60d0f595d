//! Scripted in-process device stack for tests.
//!
//! Forwards are real loopback listeners that splice each accepted connection
//! to a routed target address, so health checks and introspection calls go
//! over actual sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

use super::{
    AgentConfig, AgentProcess, AgentReporter, DeviceEvent, DeviceEventStream, DeviceHandle,
    DeviceLink, ForwardBridge,
};

// ============================================================================
// FakeDeviceLink
// ============================================================================

#[derive(Default)]
struct FakeState {
    events_tx: Option<mpsc::UnboundedSender<Result<DeviceEvent>>>,
    subscribe_failures: usize,
    resolve_failures: FxHashSet<DeviceId>,
    resolve_hangs: FxHashSet<DeviceId>,
    targets: FxHashMap<u16, SocketAddr>,
    failing_device_ports: FxHashSet<u16>,
    opened: Vec<(DeviceId, u16, u16)>,
    agents: FxHashMap<DeviceId, AgentReporter>,
    stop_tokens: FxHashMap<DeviceId, tokio_util::sync::CancellationToken>,
    launch_error: Option<String>,
    launches: usize,
}

/// Device stack driven by the test body.
#[derive(Default)]
pub(crate) struct FakeDeviceLink {
    state: Mutex<FakeState>,
    subscribe_calls: AtomicUsize,
    resolve_calls: AtomicUsize,
    closed_bridges: Arc<AtomicUsize>,
}

impl FakeDeviceLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn send(&self, event: Result<DeviceEvent>) {
        let state = self.state.lock();
        if let Some(tx) = &state.events_tx {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn attach(&self, id: &str) {
        self.send(Ok(DeviceEvent::Attached(DeviceId::new(id))));
    }

    pub(crate) fn detach(&self, id: &str) {
        self.send(Ok(DeviceEvent::Detached(DeviceId::new(id))));
    }

    /// Delivers a read error on the live subscription.
    pub(crate) fn break_stream(&self) {
        self.send(Err(Error::transport("usbmuxd connection reset")));
    }

    pub(crate) fn fail_next_subscribes(&self, count: usize) {
        self.state.lock().subscribe_failures = count;
    }

    pub(crate) fn fail_resolve(&self, id: &str) {
        self.state.lock().resolve_failures.insert(DeviceId::new(id));
    }

    /// Makes lookups for `id` never complete.
    pub(crate) fn hang_resolve(&self, id: &str) {
        self.state.lock().resolve_hangs.insert(DeviceId::new(id));
    }

    pub(crate) fn resolve_count(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn route(&self, device_port: u16, target: SocketAddr) {
        self.state.lock().targets.insert(device_port, target);
    }

    pub(crate) fn fail_forwards_on(&self, device_port: u16) {
        self.state.lock().failing_device_ports.insert(device_port);
    }

    pub(crate) fn fail_launch(&self, message: &str) {
        self.state.lock().launch_error = Some(message.to_string());
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn opened_count(&self, device_port: u16) -> usize {
        self.state
            .lock()
            .opened
            .iter()
            .filter(|(_, port, _)| *port == device_port)
            .count()
    }

    pub(crate) fn open_total(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub(crate) fn closed_total(&self) -> usize {
        self.closed_bridges.load(Ordering::SeqCst)
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.state.lock().launches
    }

    /// Reports an agent error for the device. Returns `false` if no agent runs.
    pub(crate) fn fail_agent(&self, id: &str, message: &str) -> bool {
        let reporter = self.state.lock().agents.remove(&DeviceId::new(id));
        reporter.map(|r| r.exited(Err(message.to_string()))).is_some()
    }

    pub(crate) fn exit_agent(&self, id: &str) -> bool {
        let reporter = self.state.lock().agents.remove(&DeviceId::new(id));
        reporter.map(|r| r.exited(Ok(()))).is_some()
    }

    pub(crate) fn agent_stop_requested(&self, id: &str) -> bool {
        self.state
            .lock()
            .stop_tokens
            .get(&DeviceId::new(id))
            .is_some_and(tokio_util::sync::CancellationToken::is_cancelled)
    }

    /// Waits until `subscribe` has been called at least `count` times.
    pub(crate) async fn wait_for_subscriptions(&self, count: usize) {
        wait_until(|| self.subscribe_count() >= count).await;
    }
}

#[async_trait]
impl DeviceLink for FakeDeviceLink {
    async fn subscribe(&self) -> Result<DeviceEventStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(Error::transport("could not connect to usbmuxd"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events_tx = Some(tx);
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(events))
    }

    async fn resolve_device(&self, id: &DeviceId) -> Result<DeviceHandle> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let hangs = {
            let state = self.state.lock();
            if state.resolve_failures.contains(id) {
                return Err(Error::transport(format!("device {id} not found")));
            }
            state.resolve_hangs.contains(id)
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(DeviceHandle::new(id.clone())
            .with_name("Test iPhone")
            .with_product_type("iPhone14,2")
            .with_product_version("17.4"))
    }

    async fn open_forward(
        &self,
        device: &DeviceHandle,
        device_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardBridge>> {
        let target = {
            let mut state = self.state.lock();
            if state.failing_device_ports.contains(&device_port) {
                return Err(Error::forward(device_port, local_port, "device refused"));
            }
            state.opened.push((device.id.clone(), device_port, local_port));
            state.targets.get(&device_port).copied()
        };

        let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
        let task = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let Some(target) = target else { continue };
                tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });

        Ok(Box::new(FakeBridge {
            task: Some(task),
            closed: Arc::clone(&self.closed_bridges),
        }))
    }

    async fn launch_agent(
        &self,
        device: &DeviceHandle,
        _config: &AgentConfig,
    ) -> Result<AgentProcess> {
        let mut state = self.state.lock();
        state.launches += 1;
        if let Some(message) = state.launch_error.clone() {
            return Err(Error::agent_launch_failed(device.id.clone(), message));
        }
        let (process, reporter) = AgentProcess::channel();
        state
            .stop_tokens
            .insert(device.id.clone(), reporter.stop_requested());
        state.agents.insert(device.id.clone(), reporter);
        Ok(process)
    }
}

// ============================================================================
// FakeBridge
// ============================================================================

struct FakeBridge {
    task: Option<JoinHandle<()>>,
    closed: Arc<AtomicUsize>,
}

impl ForwardBridge for FakeBridge {
    fn close(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// FakeAgentHttp
// ============================================================================

/// Minimal HTTP endpoint standing in for the agent's `/status`.
pub(crate) struct FakeAgentHttp {
    addr: SocketAddr,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    /// While `true`, requests are counted but not answered.
    held: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FakeAgentHttp {
    pub(crate) async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake agent");
        let addr = listener.local_addr().expect("fake agent addr");
        let status = Arc::new(AtomicU16::new(status));
        let hits = Arc::new(AtomicUsize::new(0));
        let (held, held_rx) = watch::channel(false);

        let task = {
            let status = Arc::clone(&status);
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                while let Ok((mut conn, _)) = listener.accept().await {
                    let status = Arc::clone(&status);
                    let hits = Arc::clone(&hits);
                    let mut held = held_rx.clone();
                    tokio::spawn(async move {
                        let mut buf = [0_u8; 1024];
                        if conn.read(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                        hits.fetch_add(1, Ordering::SeqCst);
                        if held.wait_for(|held| !*held).await.is_err() {
                            return;
                        }
                        let code = status.load(Ordering::SeqCst);
                        let reply = format!(
                            "HTTP/1.1 {code} Fake\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}"
                        );
                        let _ = conn.write_all(reply.as_bytes()).await;
                        let _ = conn.shutdown().await;
                    });
                }
            })
        };

        Self {
            addr,
            status,
            hits,
            held,
            task,
        }
    }

    /// Stops answering until [`release`](Self::release).
    pub(crate) fn hold(&self) {
        self.held.send_replace(true);
    }

    pub(crate) fn release(&self) {
        self.held.send_replace(false);
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeAgentHttp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every 10ms, panicking after 5s.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
