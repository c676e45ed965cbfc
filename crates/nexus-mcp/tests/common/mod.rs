//! In-memory MCP server used by the integration tests.
//!
//! `MockServer` is a [`TransportFactory`]: every `open` creates a fresh
//! session whose transport answers requests synchronously, after a delay,
//! or never, depending on the tool being called.

#![allow(dead_code)]

use async_trait::async_trait;
use nexus_core::{NexusError, NexusResult};
use nexus_mcp::{
    ConnectionOptions, HealthCheckConfig, ServerConfig, Transport, TransportConfig,
    TransportEvent, TransportFactory,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// A request or notification the mock received from the client.
#[derive(Debug, Clone)]
pub struct Received {
    /// 1-based index of the transport session it arrived on.
    pub session: usize,
    pub method: String,
    pub params: Value,
}

struct MockState {
    name: String,
    tools: Mutex<Vec<Value>>,
    opens: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_tools_list: AtomicBool,
    hang_tools_list: AtomicBool,
    panic_tools_list: AtomicBool,
    hang_initialize: AtomicBool,
    received: Mutex<Vec<Received>>,
    replies: Mutex<Vec<Value>>,
    current: Mutex<Option<Arc<MockTransport>>>,
}

enum Reply {
    Now(Result<Value, Value>),
    After(Duration, Result<Value, Value>),
    Never,
    HangUp,
}

impl MockState {
    fn respond(&self, method: &str, params: &Value) -> Reply {
        match method {
            "initialize" if self.hang_initialize.load(Ordering::SeqCst) => Reply::Never,
            "initialize" => Reply::Now(Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {"subscribe": true}},
                "serverInfo": {"name": self.name, "version": "0.1.0"}
            }))),
            "tools/list" => {
                if self.panic_tools_list.swap(false, Ordering::SeqCst) {
                    panic!("tools/list handler crashed");
                }
                if self.hang_tools_list.load(Ordering::SeqCst) {
                    Reply::Never
                } else if self.fail_tools_list.load(Ordering::SeqCst) {
                    Reply::Now(Err(json!({"code": -32603, "message": "tools unavailable"})))
                } else {
                    let tools = self.tools.lock().clone();
                    Reply::Now(Ok(json!({ "tools": tools })))
                }
            }
            "tools/call" => {
                let arguments = params["arguments"].clone();
                match params["name"].as_str().unwrap_or_default() {
                    "slow" => {
                        let delay = arguments["delay_ms"].as_u64().unwrap_or(50);
                        Reply::After(Duration::from_millis(delay), Ok(echo(&arguments)))
                    }
                    "hang" => Reply::Never,
                    "close" => Reply::HangUp,
                    "fail" => Reply::Now(Err(json!({"code": -32000, "message": "tool failed"}))),
                    _ => Reply::Now(Ok(echo(&arguments))),
                }
            }
            "resources/list" => Reply::Now(Ok(json!({
                "resources": [{"uri": "file://a.txt", "name": "a.txt", "mimeType": "text/plain"}]
            }))),
            "resources/read" => Reply::Now(Ok(json!({
                "contents": [{"uri": params["uri"], "mimeType": "text/plain", "text": "hello"}]
            }))),
            "resources/subscribe" | "resources/unsubscribe" => Reply::Now(Ok(json!({}))),
            "prompts/list" => Reply::Now(Ok(json!({
                "prompts": [{
                    "name": "greet",
                    "description": "Say hello",
                    "arguments": [{"name": "who", "required": true}]
                }]
            }))),
            "prompts/get" => Reply::Now(Ok(json!({
                "description": "Say hello",
                "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": format!("hello {}", params["arguments"]["who"].as_str().unwrap_or("there"))}
                }]
            }))),
            _ => Reply::Now(Err(json!({"code": -32601, "message": "method not found"}))),
        }
    }
}

fn echo(arguments: &Value) -> Value {
    json!({
        "content": [{"type": "text", "text": arguments.to_string()}],
        "isError": false
    })
}

fn envelope(id: Value, outcome: Result<Value, Value>) -> Value {
    match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
    }
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {"type": "object"}
    })
}

pub struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    pub fn new(name: &str, tools: &[&str]) -> Arc<Self> {
        Self::with_tools(name, tools.iter().map(|t| tool(t)).collect())
    }

    pub fn with_tools(name: &str, tools: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState {
                name: name.to_string(),
                tools: Mutex::new(tools),
                opens: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(0),
                fail_tools_list: AtomicBool::new(false),
                hang_tools_list: AtomicBool::new(false),
                panic_tools_list: AtomicBool::new(false),
                hang_initialize: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
                replies: Mutex::new(Vec::new()),
                current: Mutex::new(None),
            }),
        })
    }

    /// Successful transport opens so far.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_tools_list(&self, fail: bool) {
        self.state.fail_tools_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_tools_list(&self, hang: bool) {
        self.state.hang_tools_list.store(hang, Ordering::SeqCst);
    }

    /// Make the next `tools/list` panic inside the transport.
    pub fn panic_next_tools_list(&self) {
        self.state.panic_tools_list.store(true, Ordering::SeqCst);
    }

    /// Leave `initialize` requests unanswered.
    pub fn set_hang_initialize(&self, hang: bool) {
        self.state.hang_initialize.store(hang, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    /// Requests for `method`, in arrival order.
    pub fn requests(&self, method: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    /// Responses the client sent to server-initiated requests.
    pub fn client_replies(&self) -> Vec<Value> {
        self.state.replies.lock().clone()
    }

    /// Simulate the server going away.
    pub fn drop_connection(&self) {
        let current = self.state.current.lock().clone();
        if let Some(transport) = current {
            transport.hang_up();
        }
    }

    /// Push an unsolicited notification on the current session.
    pub fn notify(&self, method: &str, params: Value) {
        self.push(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    /// Send a server-initiated request on the current session.
    pub fn server_request(&self, id: Value, method: &str) {
        self.push(json!({"jsonrpc": "2.0", "id": id, "method": method}));
    }

    /// Deliver a raw message on the current session.
    pub fn push(&self, message: Value) {
        let current = self.state.current.lock().clone();
        if let Some(transport) = current {
            if let Some(tx) = transport.tx.lock().as_ref() {
                let _ = tx.send(TransportEvent::Message(message));
            }
        }
    }
}

#[async_trait]
impl TransportFactory for MockServer {
    async fn open(&self) -> NexusResult<Arc<dyn Transport>> {
        let pending_failures = self.state.fail_opens.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.state
                .fail_opens
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(NexusError::transport(&self.state.name, "connection refused"));
        }

        let session = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            session,
            state: self.state.clone(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        });
        *self.state.current.lock() = Some(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    session: usize,
    state: Arc<MockState>,
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    fn hang_up(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(TransportEvent::Closed);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> NexusResult<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| NexusError::transport(&self.state.name, "already started"))
    }

    async fn send(&self, message: Value) -> NexusResult<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| NexusError::transport(&self.state.name, "mock transport closed"))?;

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            self.state.replies.lock().push(message);
            return Ok(());
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        self.state.received.lock().push(Received {
            session: self.session,
            method: method.to_string(),
            params: params.clone(),
        });

        let Some(id) = message.get("id").cloned() else {
            return Ok(());
        };
        match self.state.respond(method, &params) {
            Reply::Now(outcome) => {
                let _ = tx.send(TransportEvent::Message(envelope(id, outcome)));
            }
            Reply::After(delay, outcome) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TransportEvent::Message(envelope(id, outcome)));
                });
            }
            Reply::Never => {}
            Reply::HangUp => self.hang_up(),
        }
        Ok(())
    }

    async fn close(&self) -> NexusResult<()> {
        self.tx.lock().take();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Short timeouts and a 10ms reconnect delay.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        max_reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(10),
    }
}

pub fn server_config(name: &str) -> ServerConfig {
    let mut config = ServerConfig::new(
        name,
        TransportConfig {
            command: "mock-mcp-server".to_string(),
            args: vec![],
            env: HashMap::new(),
        },
    );
    config.timeout_ms = Some(2_000);
    config.reconnect_delay_ms = Some(10);
    config
}

pub fn health_check(interval_ms: u64, auto_reconnect: bool) -> HealthCheckConfig {
    HealthCheckConfig {
        interval_ms,
        timeout_ms: 500,
        auto_reconnect,
    }
}

/// Wait up to 5s for the first event matching `pred`, skipping others.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` every 5ms for up to 5s.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
