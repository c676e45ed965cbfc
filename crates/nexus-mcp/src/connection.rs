//! One logical MCP session with one server.
//!
//! A [`Connection`] owns a transport, a state machine, the table of
//! outstanding requests, and the set of tracked resource subscriptions.
//! Requests are correlated by id, so responses may complete in any order.
//! When the transport drops, every outstanding request fails with
//! [`NexusError::ConnectionClosed`] and the connection starts reconnecting
//! in the background; tracked subscriptions are replayed once the session is
//! back.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─handshake ok─▶ Connected
//!      ▲                                              │ transport lost
//!      └──retries exhausted── Reconnecting ◀──────────┘
//!                                  └──handshake ok──▶ Connected
//! ```

use crate::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};
use crate::protocol::{
    methods, Ack, CallToolResult, GetPromptResult, Incoming, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt,
    ReadResourceResult, Resource, ResourceContents, ResourceUpdatedParams, Tool,
    METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use chrono::{DateTime, Utc};
use nexus_core::{NexusError, NexusResult};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Timeouts and retry budget for a [`Connection`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Default deadline for a request (default: 30s).
    pub request_timeout: Duration,
    /// Hard ceiling on transport open plus handshake (default: 30s).
    pub connect_timeout: Duration,
    /// Reconnection attempts before giving up (default: 3).
    pub max_reconnect_attempts: u32,
    /// Fixed, non-exponential delay between attempts (default: 5s).
    pub reconnect_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

type Outcome = Result<serde_json::Value, NexusError>;

/// A request waiting for its response. The expected response shape is the
/// type parameter of the waiting [`Connection::request`] call.
struct PendingRequest {
    method: String,
    created_at: Instant,
    deadline: Instant,
    resolver: oneshot::Sender<Outcome>,
}

struct PendingGuard<'a> {
    session: &'a Mutex<Session>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.lock().pending.remove(&self.id);
    }
}

/// Everything that must change atomically with the state.
struct Session {
    state: ConnectionState,
    pending: HashMap<u64, PendingRequest>,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever the transport is installed or retired, so events from
    /// a stale transport can be recognised and ignored.
    generation: u64,
    server_info: Option<InitializeResult>,
    connected_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Detach the transport and collect every waiter. Keeps the invariant that
    /// a non-connected session has no pending requests.
    fn retire(&mut self, next: ConnectionState) -> Retired {
        let previous = self.state;
        self.state = next;
        self.generation += 1;
        self.connected_at = None;
        Retired {
            previous,
            transport: self.transport.take(),
            waiters: self.pending.drain().map(|(_, p)| p).collect(),
        }
    }
}

struct Retired {
    previous: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    waiters: Vec<PendingRequest>,
}

/// Which states a call may be issued in.
#[derive(Debug, Clone, Copy)]
enum Gate {
    Connected,
    Handshake { generation: u64 },
}

struct Inner {
    name: String,
    factory: Arc<dyn TransportFactory>,
    options: RwLock<ConnectionOptions>,
    session: Mutex<Session>,
    subscriptions: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
    /// Serializes connect and reconnect.
    reconnect_gate: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    closed: Notify,
    reconnects: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Cheaply cloneable handle to one server session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(name: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_options(name, factory, ConnectionOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        options: ConnectionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                factory,
                options: RwLock::new(options),
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    pending: HashMap::new(),
                    transport: None,
                    generation: 0,
                    server_info: None,
                    connected_at: None,
                }),
                subscriptions: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
                reconnect_gate: tokio::sync::Mutex::new(()),
                shutdown: AtomicBool::new(false),
                closed: Notify::new(),
                reconnects: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    pub fn options(&self) -> ConnectionOptions {
        self.inner.options.read().clone()
    }

    /// Default deadline for subsequent requests.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.options.write().request_timeout = timeout;
    }

    pub fn set_retry_attempts(&self, attempts: u32) {
        self.inner.options.write().max_reconnect_attempts = attempts;
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.inner.options.write().reconnect_delay = delay;
    }

    /// Receive every signal emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Tracked resource subscriptions, in URI order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.session.lock().pending.len()
    }

    /// What the server reported during the last successful handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner.session.lock().server_info.clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.session.lock().connected_at
    }

    /// Successful reconnections over the lifetime of this connection.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    fn generation(&self) -> u64 {
        self.inner.session.lock().generation
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, message: impl Into<String>) {
        self.emit(ConnectionEvent::Error {
            server: self.inner.name.clone(),
            message: message.into(),
        });
    }

    fn closed_error(&self) -> NexusError {
        NexusError::ConnectionClosed {
            server: self.inner.name.clone(),
        }
    }

    // --- Lifecycle ---

    /// Open a transport and perform the handshake. On failure the
    /// reconnection procedure takes over, so this only fails once the retry
    /// budget is spent.
    pub async fn connect(&self) -> NexusResult<()> {
        let _gate = self.inner.reconnect_gate.lock().await;
        {
            let mut session = self.inner.session.lock();
            if session.state == ConnectionState::Connected {
                return Ok(());
            }
            session.state = ConnectionState::Connecting;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);

        info!(server = %self.inner.name, "Connecting to MCP server");
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(server = %self.inner.name, error = %e, "MCP connection attempt failed");
                self.emit_error(e.to_string());
                self.reconnect_locked(0).await
            }
        }
    }

    /// Re-establish the session, starting at `attempt` (0-based).
    ///
    /// Fails with [`NexusError::MaxRetries`] without touching the transport
    /// when `attempt` already reaches the budget. If another reconnect
    /// completes while this one waits its turn, returns immediately.
    pub async fn reconnect(&self, attempt: u32) -> NexusResult<()> {
        self.reconnect_from(self.generation(), attempt).await
    }

    /// Reconnect unless the session has moved past `observed` and is live.
    async fn reconnect_from(&self, observed: u64, attempt: u32) -> NexusResult<()> {
        let _gate = self.inner.reconnect_gate.lock().await;
        if self.generation() != observed && self.state() == ConnectionState::Connected {
            debug!(server = %self.inner.name, "Session already re-established");
            return Ok(());
        }
        self.reconnect_locked(attempt).await
    }

    /// Bounded reconnection loop. Caller holds the reconnect gate.
    async fn reconnect_locked(&self, mut attempt: u32) -> NexusResult<()> {
        loop {
            let options = self.options();
            let max = options.max_reconnect_attempts;

            if attempt >= max {
                let retired = self.inner.session.lock().retire(ConnectionState::Disconnected);
                self.finish_retirement(retired).await;
                error!(server = %self.inner.name, attempts = max, "MCP server reconnection failed after retries");
                return Err(NexusError::MaxRetries {
                    server: self.inner.name.clone(),
                    attempts: max,
                });
            }

            let closed = self.inner.closed.notified();
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }

            let retired = self.inner.session.lock().retire(ConnectionState::Reconnecting);
            self.finish_retirement(retired).await;

            info!(server = %self.inner.name, attempt = attempt + 1, max, "Reconnecting to MCP server");
            self.emit(ConnectionEvent::Reconnecting {
                server: self.inner.name.clone(),
                attempt: attempt + 1,
                max,
            });

            match self.establish().await {
                Ok(()) => {
                    self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.replay_subscriptions().await;
                    info!(server = %self.inner.name, "MCP server reconnected");
                    self.emit(ConnectionEvent::Reconnected {
                        server: self.inner.name.clone(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        server = %self.inner.name,
                        attempt = attempt + 1,
                        max,
                        delay_ms = options.reconnect_delay.as_millis() as u64,
                        error = %e,
                        "MCP reconnect failed, retrying..."
                    );
                    self.emit_error(e.to_string());
                    tokio::select! {
                        _ = tokio::time::sleep(options.reconnect_delay) => {}
                        _ = closed => return Err(self.closed_error()),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Shut the transport down and move to `Disconnected`. Idempotent; also
    /// stops an in-progress reconnection loop.
    pub async fn close(&self) -> NexusResult<()> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.closed.notify_waiters();

        let retired = self.inner.session.lock().retire(ConnectionState::Disconnected);
        let previous = retired.previous;
        let transport = retired.transport.clone();
        self.resolve_closed(retired.waiters);

        if previous != ConnectionState::Disconnected {
            info!(server = %self.inner.name, "MCP connection closed");
            self.emit(ConnectionEvent::Disconnected {
                server: self.inner.name.clone(),
            });
        }
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    /// One transport open + handshake, bounded by the connect ceiling.
    async fn establish(&self) -> NexusResult<()> {
        let ceiling = self.options().connect_timeout;

        let attempt = async {
            let transport = self.inner.factory.open().await?;
            let events = match transport.start().await {
                Ok(events) => events,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            };
            let generation = match self.install(transport.clone()) {
                Ok(generation) => generation,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            };
            self.spawn_reader(generation, events);
            let info = self.handshake(generation, ceiling).await?;
            Ok::<_, NexusError>((generation, info))
        };

        let (generation, info) = match tokio::time::timeout(ceiling, attempt).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                self.discard_transport().await;
                return Err(e);
            }
            Err(_) => {
                self.discard_transport().await;
                return Err(NexusError::Timeout {
                    method: methods::INITIALIZE.to_string(),
                    timeout_ms: ceiling.as_millis() as u64,
                });
            }
        };

        {
            let mut session = self.inner.session.lock();
            if session.generation != generation || session.state == ConnectionState::Disconnected {
                return Err(self.closed_error());
            }
            session.state = ConnectionState::Connected;
            session.server_info = Some(info.clone());
            session.connected_at = Some(Utc::now());
        }

        info!(
            server = %self.inner.name,
            version = %info.protocol_version,
            remote = info.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            "MCP server initialized"
        );
        self.emit(ConnectionEvent::Connected {
            server: self.inner.name.clone(),
        });
        Ok(())
    }

    fn install(&self, transport: Arc<dyn Transport>) -> NexusResult<u64> {
        let mut session = self.inner.session.lock();
        if session.state == ConnectionState::Disconnected {
            // Closed while the transport was opening.
            return Err(self.closed_error());
        }
        session.generation += 1;
        session.transport = Some(transport);
        Ok(session.generation)
    }

    /// Drop a half-established transport after a failed attempt.
    async fn discard_transport(&self) {
        let retired = {
            let mut session = self.inner.session.lock();
            if session.state == ConnectionState::Connected {
                return;
            }
            let state = session.state;
            session.retire(state)
        };
        self.finish_retirement(retired).await;
    }

    async fn finish_retirement(&self, retired: Retired) {
        self.resolve_closed(retired.waiters);
        if retired.previous == ConnectionState::Connected {
            self.emit(ConnectionEvent::Disconnected {
                server: self.inner.name.clone(),
            });
        }
        if let Some(transport) = retired.transport {
            if let Err(e) = transport.close().await {
                debug!(server = %self.inner.name, error = %e, "Error closing retired transport");
            }
        }
    }

    fn resolve_closed(&self, waiters: Vec<PendingRequest>) {
        for waiter in waiters {
            debug!(server = %self.inner.name, method = %waiter.method, "Failing pending request: connection closed");
            let _ = waiter.resolver.send(Err(self.closed_error()));
        }
    }

    async fn handshake(&self, generation: u64, timeout: Duration) -> NexusResult<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "nexus",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let value = self
            .call(
                methods::INITIALIZE,
                Some(params),
                timeout,
                Gate::Handshake { generation },
            )
            .await?;
        let info: InitializeResult = serde_json::from_value(value)
            .map_err(|e| NexusError::protocol("failed to parse initialize result", e))?;

        let transport = self.transport_for(Gate::Handshake { generation })?;
        let notification = JsonRpcNotification::new(methods::INITIALIZED, None);
        transport.send(serde_json::to_value(&notification)?).await?;
        Ok(info)
    }

    async fn replay_subscriptions(&self) {
        for uri in self.subscriptions() {
            if let Err(e) = self.subscribe_to_resource(&uri, false).await {
                warn!(server = %self.inner.name, uri = %uri, error = %e, "Failed to restore resource subscription");
                self.emit_error(format!("failed to restore subscription to {uri}: {e}"));
            }
        }
    }

    // --- Inbound traffic ---

    fn spawn_reader(&self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let conn = Connection { inner };
                if conn.generation() != generation {
                    break;
                }
                match event {
                    TransportEvent::Message(value) => conn.dispatch(value).await,
                    TransportEvent::Error(message) => {
                        conn.on_transport_lost(generation, format!("transport error: {message}"));
                        break;
                    }
                    TransportEvent::Closed => {
                        conn.on_transport_lost(generation, "transport closed".to_string());
                        break;
                    }
                }
            }
        });
    }

    async fn dispatch(&self, value: serde_json::Value) {
        let message = match Incoming::parse(value) {
            Ok(message) => message,
            Err(e) => {
                debug!(server = %self.inner.name, error = %e, "Ignoring malformed message");
                return;
            }
        };

        match message {
            Incoming::Response { id, outcome } => {
                let waiter = self.inner.session.lock().pending.remove(&id);
                match waiter {
                    Some(waiter) => {
                        debug!(
                            server = %self.inner.name,
                            id,
                            method = %waiter.method,
                            elapsed_ms = waiter.created_at.elapsed().as_millis() as u64,
                            "Response received"
                        );
                        let _ = waiter.resolver.send(outcome.map_err(NexusError::from));
                    }
                    None => {
                        debug!(server = %self.inner.name, id, "Dropping response for abandoned request");
                    }
                }
            }
            Incoming::Notification { method, params } => {
                if method == methods::RESOURCES_UPDATED {
                    match serde_json::from_value::<ResourceUpdatedParams>(params) {
                        Ok(update) => self.emit(ConnectionEvent::SubscriptionUpdated {
                            server: self.inner.name.clone(),
                            uri: update.uri,
                            contents: update.contents,
                        }),
                        Err(e) => {
                            debug!(server = %self.inner.name, error = %e, "Malformed resource update");
                        }
                    }
                } else {
                    self.emit(ConnectionEvent::Notification {
                        server: self.inner.name.clone(),
                        method,
                        params,
                    });
                }
            }
            Incoming::Request { id, method, .. } => {
                let reply = if method == methods::PING {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
                } else {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": METHOD_NOT_FOUND, "message": format!("method not supported by client: {method}")}
                    })
                };
                let transport = self.inner.session.lock().transport.clone();
                if let Some(transport) = transport {
                    if let Err(e) = transport.send(reply).await {
                        debug!(server = %self.inner.name, error = %e, "Failed to answer server request");
                    }
                }
            }
        }
    }

    fn on_transport_lost(&self, generation: u64, reason: String) {
        let (retired, observed) = {
            let mut session = self.inner.session.lock();
            if session.generation != generation {
                return;
            }
            match session.state {
                ConnectionState::Connected => {
                    let retired = session.retire(ConnectionState::Reconnecting);
                    (retired, session.generation)
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    // Mid-handshake: fail the handshake now and let its caller retry.
                    let waiters: Vec<PendingRequest> =
                        session.pending.drain().map(|(_, p)| p).collect();
                    drop(session);
                    debug!(server = %self.inner.name, reason = %reason, "Transport lost during handshake");
                    self.resolve_closed(waiters);
                    return;
                }
                ConnectionState::Disconnected => return,
            }
        };

        warn!(server = %self.inner.name, reason = %reason, "MCP transport lost");
        self.emit_error(reason);

        let conn = self.clone();
        tokio::spawn(async move {
            conn.finish_retirement(retired).await;
            if let Err(e) = conn.reconnect_from(observed, 0).await {
                warn!(server = %conn.inner.name, error = %e, "Automatic reconnection gave up");
            }
        });
    }

    // --- Requests ---

    fn transport_for(&self, gate: Gate) -> NexusResult<Arc<dyn Transport>> {
        let session = self.inner.session.lock();
        self.check_gate(&session, gate)?;
        session.transport.clone().ok_or_else(|| self.closed_error())
    }

    fn check_gate(&self, session: &Session, gate: Gate) -> NexusResult<()> {
        match gate {
            Gate::Connected if session.state != ConnectionState::Connected => {
                Err(NexusError::NotConnected {
                    server: self.inner.name.clone(),
                    state: session.state.to_string(),
                })
            }
            Gate::Handshake { generation }
                if session.generation != generation
                    || session.state == ConnectionState::Disconnected =>
            {
                Err(self.closed_error())
            }
            _ => Ok(()),
        }
    }

    /// Send a correlated request and wait for its response or the deadline.
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        gate: Gate,
    ) -> NexusResult<serde_json::Value> {
        if timeout.is_zero() {
            return Err(NexusError::InvalidParams(
                "request timeout must be greater than zero".into(),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let transport = {
            let mut session = self.inner.session.lock();
            self.check_gate(&session, gate)?;
            let transport = session.transport.clone().ok_or_else(|| self.closed_error())?;
            session.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    created_at,
                    deadline,
                    resolver: tx,
                },
            );
            transport
        };

        // Removes the entry however this call ends, including when the caller
        // drops the future.
        let _pending = PendingGuard {
            session: &self.inner.session,
            id,
        };

        debug!(server = %self.inner.name, id, method, "Sending request");
        transport.send(message).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                // Abandon the local waiter only; a late response is dropped by id.
                if let Some(waiter) = self.inner.session.lock().pending.remove(&id) {
                    debug!(
                        server = %self.inner.name,
                        id,
                        method,
                        overdue_ms = waiter.deadline.elapsed().as_millis() as u64,
                        "Request timed out"
                    );
                }
                Err(NexusError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Issue `method` and parse the result as `T`. `timeout` defaults to the
    /// connection's request timeout.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> NexusResult<T> {
        let timeout = timeout.unwrap_or_else(|| self.options().request_timeout);
        let value = self.call(method, params, timeout, Gate::Connected).await?;
        serde_json::from_value(value)
            .map_err(|e| NexusError::protocol(format!("unexpected '{method}' result"), e))
    }

    pub async fn list_tools(&self) -> NexusResult<Vec<Tool>> {
        let result: ListToolsResult = self
            .request(methods::TOOLS_LIST, Some(serde_json::json!({})), None)
            .await?;
        Ok(result.tools)
    }

    /// Invoke a tool. Emits `tool_called` on success and `error` on failure.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> NexusResult<CallToolResult> {
        self.call_tool_with_timeout(name, arguments, None).await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> NexusResult<CallToolResult> {
        if name.is_empty() {
            return Err(NexusError::InvalidParams("tool name is required".into()));
        }
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        match self
            .request::<CallToolResult>(methods::TOOLS_CALL, Some(params), timeout)
            .await
        {
            Ok(result) => {
                self.emit(ConnectionEvent::ToolCalled {
                    server: self.inner.name.clone(),
                    name: name.to_string(),
                    arguments,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                self.emit_error(format!("failed to call tool {name}: {e}"));
                Err(e)
            }
        }
    }

    pub async fn list_resources(&self) -> NexusResult<Vec<Resource>> {
        let result: ListResourcesResult = self
            .request(methods::RESOURCES_LIST, Some(serde_json::json!({})), None)
            .await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> NexusResult<Vec<ResourceContents>> {
        if uri.is_empty() {
            return Err(NexusError::InvalidParams("resource URI is required".into()));
        }
        let result: ReadResourceResult = self
            .request(
                methods::RESOURCES_READ,
                Some(serde_json::json!({ "uri": uri })),
                None,
            )
            .await?;
        Ok(result.contents)
    }

    pub async fn list_prompts(&self) -> NexusResult<Vec<Prompt>> {
        let result: ListPromptsResult = self
            .request(methods::PROMPTS_LIST, Some(serde_json::json!({})), None)
            .await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> NexusResult<GetPromptResult> {
        if name.is_empty() {
            return Err(NexusError::InvalidParams("prompt name is required".into()));
        }
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request(methods::PROMPTS_GET, Some(params), None).await
    }

    /// Subscribe to update notifications for `uri`. With `track`, the
    /// subscription is remembered and replayed after every reconnect.
    pub async fn subscribe_to_resource(&self, uri: &str, track: bool) -> NexusResult<()> {
        if uri.is_empty() {
            return Err(NexusError::InvalidParams("resource URI is required".into()));
        }
        self.request::<Ack>(
            methods::RESOURCES_SUBSCRIBE,
            Some(serde_json::json!({ "uri": uri })),
            None,
        )
        .await?;
        if track {
            self.inner.subscriptions.lock().insert(uri.to_string());
        }
        debug!(server = %self.inner.name, uri, track, "Subscribed to resource");
        Ok(())
    }

    /// The URI stays tracked unless the server acknowledges.
    pub async fn unsubscribe_from_resource(&self, uri: &str) -> NexusResult<()> {
        if uri.is_empty() {
            return Err(NexusError::InvalidParams("resource URI is required".into()));
        }
        self.request::<Ack>(
            methods::RESOURCES_UNSUBSCRIBE,
            Some(serde_json::json!({ "uri": uri })),
            None,
        )
        .await?;
        self.inner.subscriptions.lock().remove(uri);
        Ok(())
    }

    /// Whether the server currently advertises `name`. Any failure counts as no.
    pub async fn has_tool(&self, name: &str) -> bool {
        match self.list_tools().await {
            Ok(tools) => tools.iter().any(|t| t.name == name),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Factory that counts opens and always fails.
    #[derive(Default)]
    struct RefusingFactory {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl TransportFactory for RefusingFactory {
        async fn open(&self) -> NexusResult<Arc<dyn Transport>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(NexusError::transport("test", "connection refused"))
        }
    }

    fn fast_options(max_reconnect_attempts: u32) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_initial_state() {
        let conn = Connection::new("a", Arc::new(RefusingFactory::default()));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.subscriptions().is_empty());
        assert!(conn.server_info().is_none());
        assert_eq!(conn.options(), ConnectionOptions::default());
    }

    #[test]
    fn test_setters() {
        let conn = Connection::new("a", Arc::new(RefusingFactory::default()));
        conn.set_timeout(Duration::from_secs(60));
        conn.set_retry_attempts(5);
        conn.set_reconnect_delay(Duration::from_secs(1));
        let options = conn.options();
        assert_eq!(options.request_timeout, Duration::from_secs(60));
        assert_eq!(options.max_reconnect_attempts, 5);
        assert_eq!(options.reconnect_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_when_disconnected() {
        let conn = Connection::new("a", Arc::new(RefusingFactory::default()));
        let err = conn.list_tools().await.unwrap_err();
        assert!(matches!(err, NexusError::NotConnected { ref state, .. } if state == "disconnected"));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_anything_else() {
        let conn = Connection::new("a", Arc::new(RefusingFactory::default()));
        assert!(matches!(
            conn.subscribe_to_resource("", true).await,
            Err(NexusError::InvalidParams(_))
        ));
        assert!(matches!(
            conn.unsubscribe_from_resource("").await,
            Err(NexusError::InvalidParams(_))
        ));
        assert!(matches!(
            conn.read_resource("").await,
            Err(NexusError::InvalidParams(_))
        ));
        assert!(matches!(
            conn.call_tool("", serde_json::json!({})).await,
            Err(NexusError::InvalidParams(_))
        ));
        assert!(matches!(
            conn.get_prompt("", None).await,
            Err(NexusError::InvalidParams(_))
        ));
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_at_budget_makes_no_transport_attempt() {
        let factory = Arc::new(RefusingFactory::default());
        let conn = Connection::with_options("a", factory.clone(), fast_options(3));

        let err = conn.reconnect(3).await.unwrap_err();
        assert!(matches!(err, NexusError::MaxRetries { attempts: 3, .. }));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_exhausts_fixed_budget() {
        let factory = Arc::new(RefusingFactory::default());
        let conn = Connection::with_options("a", factory.clone(), fast_options(2));
        let mut events = conn.subscribe();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, NexusError::MaxRetries { attempts: 2, .. }));
        // Initial attempt plus two reconnection attempts.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Reconnecting { attempt, max, .. } = event {
                assert_eq!(max, 2);
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = Connection::new("a", Arc::new(RefusingFactory::default()));
        let mut events = conn.subscribe();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // Never connected, so nothing to announce.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_stops_reconnect_loop() {
        let factory = Arc::new(RefusingFactory::default());
        let mut options = fast_options(1_000);
        options.reconnect_delay = Duration::from_secs(60);
        let conn = Connection::with_options("a", factory, options);

        let connecting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("reconnect loop should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(NexusError::ConnectionClosed { .. })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
