//! Server configuration, loaded from TOML.

use crate::connection::ConnectionOptions;
use nexus_core::{NexusError, NexusResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// How to launch a server process.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransportConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Periodic health probing for one server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Time between ticks in milliseconds (default: 30000).
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Deadline for a single probe in milliseconds (default: 5000).
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Reconnect as soon as a probe fails (default: false).
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            auto_reconnect: false,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    /// Category for tools that don't advertise their own.
    #[serde(default)]
    pub category: Option<String>,
    pub transport: TransportConfig,
    /// Request timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Max reconnection attempts override.
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Fixed delay between reconnection attempts, in milliseconds.
    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl ServerConfig {
    /// A config with no overrides and no health check.
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            category: None,
            transport,
            timeout_ms: None,
            retry_attempts: None,
            reconnect_delay_ms: None,
            health_check: None,
        }
    }

    /// Default connection options with this server's overrides applied.
    pub fn connection_options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::default();
        if let Some(ms) = self.timeout_ms {
            options.request_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.retry_attempts {
            options.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = self.reconnect_delay_ms {
            options.reconnect_delay = Duration::from_millis(ms);
        }
        options
    }

    pub fn validate(&self) -> NexusResult<()> {
        if self.name.trim().is_empty() {
            return Err(NexusError::Config("server name must not be empty".into()));
        }
        if self.transport.command.trim().is_empty() {
            return Err(NexusError::Config(format!(
                "server '{}': transport command must not be empty",
                self.name
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(NexusError::Config(format!(
                "server '{}': timeout_ms must be greater than zero",
                self.name
            )));
        }
        if let Some(hc) = &self.health_check {
            if hc.interval_ms == 0 || hc.timeout_ms == 0 {
                return Err(NexusError::Config(format!(
                    "server '{}': health check interval and timeout must be greater than zero",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl NexusConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> NexusResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| NexusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: &Path) -> NexusResult<Self> {
        let input = tokio::fs::read_to_string(path).await.map_err(|e| {
            NexusError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> NexusResult<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(NexusError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }
}
