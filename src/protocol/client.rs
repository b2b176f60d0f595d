//! Introspection socket client.
//!
//! Talks to the on-device UI introspection service through a forwarded
//! loopback port, one framed JSON-RPC request at a time.
//!
//! # Request/Response Discipline
//!
//! The connection carries strictly one request followed by its response.
//! Request ids are generated but responses are not matched against them, so
//! the stream lock is held for the whole exchange and requests are never
//! pipelined.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

use super::frame::{read_frame, write_frame};
use super::request::{RpcRequest, extract_result};

// ============================================================================
// Constants
// ============================================================================

/// Connection attempts before `connect` gives up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;

/// Delay between two connection attempts.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// IntrospectionClient
// ============================================================================

/// Persistent framed JSON-RPC connection to `localhost:<port>`.
pub struct IntrospectionClient {
    port: u16,
    connect_attempts: u32,
    connect_delay: Duration,
    /// Held for the whole request/response exchange.
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl fmt::Debug for IntrospectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrospectionClient")
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl IntrospectionClient {
    /// Creates a disconnected client for `localhost:port`.
    #[inline]
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self::with_retry(port, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY)
    }

    /// Creates a client with a custom connect retry policy.
    #[must_use]
    pub fn with_retry(port: u16, connect_attempts: u32, connect_delay: Duration) -> Self {
        Self {
            port,
            connect_attempts: connect_attempts.max(1),
            connect_delay,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Returns the local port this client dials.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` while a connection is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connects, retrying with a fixed delay.
    ///
    /// Gives up silently after the attempt ceiling; check
    /// [`is_connected`](Self::is_connected) afterwards.
    pub async fn connect(&self) {
        let mut stream = self.stream.lock().await;
        if stream.is_some() {
            return;
        }

        for attempt in 1..=self.connect_attempts {
            match TcpStream::connect(("localhost", self.port)).await {
                Ok(conn) => {
                    let _ = conn.set_nodelay(true);
                    *stream = Some(conn);
                    self.connected.store(true, Ordering::SeqCst);
                    info!(port = self.port, attempt, "Introspection socket connected");
                    return;
                }
                Err(e) => {
                    debug!(port = self.port, attempt, error = %e, "Connection attempt failed");
                }
            }

            if attempt < self.connect_attempts {
                sleep(self.connect_delay).await;
            }
        }

        warn!(
            port = self.port,
            attempts = self.connect_attempts,
            "Introspection socket connection failed"
        );
    }

    /// Sends a request and returns `{"result": <value>}`.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if not connected, the response frame is
    ///   incomplete, or the response has no `result`
    /// - [`Error::Io`] on write failure or a truncated header
    /// - [`Error::Json`] if the request cannot be serialized
    pub async fn send_and_receive(&self, request: &RpcRequest) -> Result<Value> {
        let body = request.to_bytes()?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::protocol("socket is not connected"))?;

        trace!(method = %request.method, id = %request.id, "Sending request");
        write_frame(stream, &body).await?;
        let response = read_frame(stream).await?;
        drop(guard);

        extract_result(&response)
    }

    /// Sends `method` with positional `params`.
    ///
    /// # Errors
    ///
    /// See [`send_and_receive`](Self::send_and_receive).
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.send_and_receive(&RpcRequest::new(method, params)).await
    }

    /// Dumps the UI hierarchy, connecting first if needed.
    ///
    /// # Errors
    ///
    /// See [`send_and_receive`](Self::send_and_receive).
    pub async fn dump(&self) -> Result<Value> {
        if !self.is_connected() {
            self.connect().await;
        }
        self.call("Dump", vec![Value::Bool(true)]).await
    }

    /// Closes the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
            info!(port = self.port, "Introspection socket closed");
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
