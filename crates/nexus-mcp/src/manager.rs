use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::events::{ManagerEvent, EVENT_CHANNEL_CAPACITY};
use crate::health::{HealthMonitor, HealthTable, ServerHealth};
use crate::protocol::{CallToolResult, Tool};
use crate::transport::{StdioTransportFactory, TransportFactory};
use chrono::{DateTime, Utc};
use nexus_core::{NexusError, NexusResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of one managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub category: Option<String>,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub subscriptions: Vec<String>,
    pub health: Option<ServerHealth>,
}

/// A tool in the aggregated catalog, with the server that provides it.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogTool {
    pub server: String,
    /// The tool's own category, else its server's.
    pub category: Option<String>,
    pub tool: Tool,
}

struct ManagedServer {
    config: ServerConfig,
    connection: Connection,
    tools: Vec<Tool>,
    monitor: Option<JoinHandle<()>>,
    relay: JoinHandle<()>,
}

impl ManagedServer {
    fn stop_tasks(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
        self.relay.abort();
    }
}

/// Owns named connections, the global tool route table and the per-server
/// health monitors.
pub struct ConnectionManager {
    servers: RwLock<HashMap<String, ManagedServer>>,
    /// Tool name to owning server; the most recent registration wins.
    tool_routes: RwLock<HashMap<String, String>>,
    health: HealthTable,
    events: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            servers: RwLock::new(HashMap::new()),
            tool_routes: RwLock::new(HashMap::new()),
            health: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Receive manager signals, including every relayed connection signal.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// Connect every configured server. Returns the errors for servers that
    /// failed; the others stay connected.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> Vec<NexusError> {
        let mut errors = Vec::new();
        for config in configs {
            if let Err(e) = self.connect_to_server(config.clone()).await {
                warn!(server = %config.name, error = %e, "Failed to connect MCP server");
                errors.push(e);
            }
        }
        errors
    }

    /// Spawn the configured server process and connect to it.
    pub async fn connect_to_server(&self, config: ServerConfig) -> NexusResult<Connection> {
        let factory = Arc::new(StdioTransportFactory::new(
            config.name.clone(),
            config.transport.clone(),
        ));
        self.connect_with_transport(config, factory).await
    }

    /// Connect using an injected transport factory. A server already
    /// registered under the same name is disconnected first.
    pub async fn connect_with_transport(
        &self,
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> NexusResult<Connection> {
        config.validate()?;
        if self.servers.read().await.contains_key(&config.name) {
            info!(server = %config.name, "Replacing existing MCP server");
            self.disconnect_server(&config.name).await?;
        }

        let connection =
            Connection::with_options(config.name.clone(), factory, config.connection_options());
        let relay = self.spawn_relay(&connection);

        let tools = match self.establish(&connection).await {
            Ok(tools) => tools,
            Err(e) => {
                relay.abort();
                let _ = connection.close().await;
                self.emit(ManagerEvent::ServerError {
                    name: config.name.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.register_routes(&config.name, &tools).await;

        let monitor = config.health_check.clone().map(|hc| {
            HealthMonitor::new(
                config.name.clone(),
                connection.clone(),
                hc,
                self.health.clone(),
                self.events.clone(),
            )
            .spawn()
        });

        info!(server = %config.name, tools = tools.len(), "MCP server connected");
        let name = config.name.clone();
        let replaced = self.servers.write().await.insert(
            name.clone(),
            ManagedServer {
                config,
                connection: connection.clone(),
                tools,
                monitor,
                relay,
            },
        );
        if let Some(previous) = replaced {
            // A concurrent connect under the same name finished first.
            self.retire_replaced(&name, previous).await;
        }
        self.emit(ManagerEvent::ServerConnected { name });
        Ok(connection)
    }

    async fn retire_replaced(&self, name: &str, previous: ManagedServer) {
        previous.stop_tasks();
        {
            let servers = self.servers.read().await;
            let current: Vec<&str> = servers
                .get(name)
                .map(|s| s.tools.iter().map(|t| t.name.as_str()).collect())
                .unwrap_or_default();
            self.tool_routes
                .write()
                .await
                .retain(|tool, owner| owner != name || current.contains(&tool.as_str()));
        }
        if let Err(e) = previous.connection.close().await {
            warn!(server = %name, error = %e, "Error closing replaced MCP server");
        }
        info!(server = %name, "Replaced MCP server disconnected");
        self.emit(ManagerEvent::ServerDisconnected {
            name: name.to_string(),
        });
    }

    async fn establish(&self, connection: &Connection) -> NexusResult<Vec<Tool>> {
        connection.connect().await?;
        connection.list_tools().await
    }

    async fn register_routes(&self, server: &str, tools: &[Tool]) {
        let mut routes = self.tool_routes.write().await;
        for tool in tools {
            if let Some(previous) = routes.insert(tool.name.clone(), server.to_string()) {
                if previous != server {
                    warn!(tool = %tool.name, previous = %previous, server = %server, "Tool name already routed; overriding");
                }
            }
        }
    }

    fn spawn_relay(&self, connection: &Connection) -> JoinHandle<()> {
        let mut signals = connection.subscribe();
        let events = self.events.clone();
        let server = connection.name().to_string();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        let _ = events.send(ManagerEvent::Relayed { signal });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(server = %server, skipped, "Signal relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Server currently routed for `tool_name`.
    pub async fn find_client_for_tool(&self, tool_name: &str) -> Option<Connection> {
        let server = self.tool_routes.read().await.get(tool_name).cloned()?;
        self.get_client(&server).await
    }

    pub async fn get_client(&self, name: &str) -> Option<Connection> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|s| s.connection.clone())
    }

    /// Tools cached at connect time, ordered by server name.
    pub async fn list_tools(&self) -> Vec<CatalogTool> {
        self.get_tools_by_category(None).await
    }

    /// Tools whose effective category equals `category`; `None` returns all.
    pub async fn get_tools_by_category(&self, category: Option<&str>) -> Vec<CatalogTool> {
        let servers = self.servers.read().await;
        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();

        let mut catalog = Vec::new();
        for name in names {
            let server = &servers[name];
            for tool in &server.tools {
                let effective = tool
                    .category
                    .clone()
                    .or_else(|| server.config.category.clone());
                if category.is_none() || effective.as_deref() == category {
                    catalog.push(CatalogTool {
                        server: name.clone(),
                        category: effective,
                        tool: tool.clone(),
                    });
                }
            }
        }
        catalog
    }

    /// Route a tool call to the server that advertises the tool.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> NexusResult<CallToolResult> {
        let connection = self
            .find_client_for_tool(tool_name)
            .await
            .ok_or_else(|| NexusError::UnknownTool(tool_name.to_string()))?;
        connection.call_tool(tool_name, arguments).await
    }

    /// Close one server and forget its routes and health record.
    pub async fn disconnect_server(&self, name: &str) -> NexusResult<()> {
        let server = self
            .servers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| NexusError::UnknownServer(name.to_string()))?;

        server.stop_tasks();
        self.tool_routes.write().await.retain(|_, owner| owner != name);
        self.health.write().await.remove(name);

        if let Err(e) = server.connection.close().await {
            warn!(server = %name, error = %e, "Error closing MCP server");
        }
        info!(server = %name, "MCP server disconnected");
        self.emit(ManagerEvent::ServerDisconnected {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Close every connection and stop every monitor. Servers that are
    /// already disconnected are fine.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, ManagedServer)> =
            self.servers.write().await.drain().collect();
        self.tool_routes.write().await.clear();

        for (name, server) in drained {
            server.stop_tasks();
            if let Err(e) = server.connection.close().await {
                warn!(server = %name, error = %e, "Error closing MCP server");
            }
            self.emit(ManagerEvent::ServerDisconnected { name });
        }
    }

    /// [`disconnect_all`](Self::disconnect_all) plus dropping every health record.
    pub async fn cleanup(&self) {
        self.disconnect_all().await;
        self.health.write().await.clear();
        debug!("Connection manager cleaned up");
    }

    /// Last recorded health, for one server or all of them. Never probes.
    pub async fn get_server_health(&self, name: Option<&str>) -> HashMap<String, ServerHealth> {
        let health = self.health.read().await;
        match name {
            Some(name) => health
                .get(name)
                .map(|h| HashMap::from([(name.to_string(), h.clone())]))
                .unwrap_or_default(),
            None => health.clone(),
        }
    }

    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn connected_count(&self) -> usize {
        self.servers
            .read()
            .await
            .values()
            .filter(|s| s.connection.state() == ConnectionState::Connected)
            .count()
    }

    /// Registered server names, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every managed server, sorted by name.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let health = self.health.read().await;
        let servers = self.servers.read().await;
        let mut status: Vec<ServerStatus> = servers
            .iter()
            .map(|(name, s)| ServerStatus {
                name: name.clone(),
                category: s.config.category.clone(),
                state: s.connection.state(),
                tool_count: s.tools.len(),
                connected_at: s.connection.connected_at(),
                reconnect_count: s.connection.reconnect_count(),
                subscriptions: s.connection.subscriptions(),
                health: health.get(name).cloned(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for server in self.servers.get_mut().values() {
            server.stop_tasks();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn nonexistent(name: &str) -> ServerConfig {
        let mut config = ServerConfig::new(
            name,
            TransportConfig {
                command: "/nonexistent/mcp-server".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        config.retry_attempts = Some(0);
        config
    }

    #[tokio::test]
    async fn test_manager_empty() {
        let mgr = ConnectionManager::new();
        assert_eq!(mgr.server_count().await, 0);
        assert_eq!(mgr.connected_count().await, 0);
        assert!(mgr.status().await.is_empty());
        assert!(mgr.list_tools().await.is_empty());
        assert!(mgr.get_server_health(None).await.is_empty());
        assert!(mgr.find_client_for_tool("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_connect_nonexistent_server() {
        let mgr = ConnectionManager::new();
        let mut events = mgr.subscribe();

        let errors = mgr.connect_all(&[nonexistent("ghost")]).await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], NexusError::MaxRetries { attempts: 0, .. }));
        assert_eq!(mgr.server_count().await, 0);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::ServerError { name, .. } = event {
                assert_eq!(name, "ghost");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mgr = ConnectionManager::new();
        let mut config = nonexistent("bad");
        config.timeout_ms = Some(0);
        let err = mgr.connect_to_server(config).await.unwrap_err();
        assert_eq!(err.code(), nexus_core::ErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn test_unknown_lookups() {
        let mgr = ConnectionManager::new();
        assert!(matches!(
            mgr.call_tool("missing", serde_json::json!({})).await,
            Err(NexusError::UnknownTool(_))
        ));
        assert!(matches!(
            mgr.disconnect_server("missing").await,
            Err(NexusError::UnknownServer(_))
        ));
        // Safe on an empty manager.
        mgr.cleanup().await;
    }

    #[test]
    fn test_server_status_serialization() {
        let status = ServerStatus {
            name: "git".to_string(),
            category: Some("vcs".to_string()),
            state: ConnectionState::Reconnecting,
            tool_count: 5,
            connected_at: None,
            reconnect_count: 2,
            subscriptions: vec!["file://a.txt".to_string()],
            health: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["tool_count"], 5);
        assert_eq!(json["subscriptions"][0], "file://a.txt");
    }
}
