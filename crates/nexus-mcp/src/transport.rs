//! Transport adapters: the opaque bidirectional JSON channel a
//! [`Connection`](crate::Connection) speaks over.
//!
//! A transport hands its inbound traffic to the connection as a stream of
//! [`TransportEvent`]s on an mpsc channel returned by [`Transport::start`].
//! Each connect or reconnect attempt asks a [`TransportFactory`] for a fresh
//! transport; a transport is never reused after it closed.

use crate::config::TransportConfig;
use async_trait::async_trait;
use nexus_core::{NexusError, NexusResult};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded JSON message from the server.
    Message(serde_json::Value),
    /// The channel failed; no further messages will arrive.
    Error(String),
    /// The peer closed the channel.
    Closed,
}

/// A bidirectional JSON message channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering inbound events. May be called once.
    async fn start(&self) -> NexusResult<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one JSON message.
    async fn send(&self, message: serde_json::Value) -> NexusResult<()>;

    /// Shut the channel down. Must be idempotent.
    async fn close(&self) -> NexusResult<()>;
}

/// Opens fresh transports to the same server.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> NexusResult<Arc<dyn Transport>>;
}

/// Newline-delimited JSON over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the server process described by `config`.
    pub fn spawn(server_name: &str, config: &TransportConfig) -> NexusResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| NexusError::Transport {
            server: server_name.to_string(),
            message: format!("failed to spawn '{}'", config.command),
            source: Some(e),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| NexusError::transport(server_name, "server stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NexusError::transport(server_name, "server stdout not available"))?;

        info!(server = %server_name, command = %config.command, "MCP server process spawned");

        Ok(Self {
            server_name: server_name.to_string(),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            child: Mutex::new(child),
        })
    }

    fn io_error(&self, message: &str, source: std::io::Error) -> NexusError {
        NexusError::Transport {
            server: self.server_name.clone(),
            message: message.to_string(),
            source: Some(source),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> NexusResult<mpsc::UnboundedReceiver<TransportEvent>> {
        let stdout = self
            .stdout
            .lock()
            .await
            .take()
            .ok_or_else(|| NexusError::transport(&self.server_name, "transport already started"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let server = self.server_name.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %server, "MCP server stdout closed");
                        let _ = tx.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(trimmed) {
                            Ok(value) => {
                                if tx.send(TransportEvent::Message(value)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Servers commonly log to stdout; skip anything that isn't JSON.
                                debug!(server = %server, line = %trimmed, error = %e, "Non-JSON line from MCP server");
                            }
                        }
                    }
                    Err(e) => {
                        error!(server = %server, error = %e, "Error reading MCP server stdout");
                        let _ = tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: serde_json::Value) -> NexusResult<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| NexusError::transport(&self.server_name, "transport is closed"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error("failed to write to stdin", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.io_error("failed to flush stdin", e))?;
        Ok(())
    }

    async fn close(&self) -> NexusResult<()> {
        // Dropping stdin lets well-behaved servers exit on EOF.
        let had_stdin = self.stdin.lock().await.take().is_some();
        if !had_stdin {
            return Ok(());
        }
        let mut child = self.child.lock().await;
        if child
            .try_wait()
            .map_err(|e| self.io_error("failed to poll server process", e))?
            .is_none()
        {
            child
                .kill()
                .await
                .map_err(|e| self.io_error("failed to kill server process", e))?;
        }
        debug!(server = %self.server_name, "MCP server process stopped");
        Ok(())
    }
}

/// Spawns a new [`StdioTransport`] per attempt.
pub struct StdioTransportFactory {
    server_name: String,
    config: TransportConfig,
}

impl StdioTransportFactory {
    pub fn new(server_name: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            server_name: server_name.into(),
            config,
        }
    }
}

#[async_trait]
impl TransportFactory for StdioTransportFactory {
    async fn open(&self) -> NexusResult<Arc<dyn Transport>> {
        let transport = StdioTransport::spawn(&self.server_name, &self.config)?;
        Ok(Arc::new(transport))
    }
}
