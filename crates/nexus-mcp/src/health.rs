//! Periodic health probing for managed servers.

use crate::config::HealthCheckConfig;
use crate::connection::Connection;
use crate::events::ManagerEvent;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of the most recent probe of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub latency_ms: u64,
    pub errors: Vec<String>,
}

impl ServerHealth {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            latency_ms,
            errors: Vec::new(),
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_check: Utc::now(),
            latency_ms,
            errors: vec![error.into()],
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Latest health record per server name, shared with the manager.
pub type HealthTable = Arc<RwLock<HashMap<String, ServerHealth>>>;

const TIMEOUT_MESSAGE: &str = "Health check timeout";

/// Probes one server on a fixed interval by listing its tools.
///
/// A probe never stops the loop: errors, timeouts and panics are all
/// recorded as an unhealthy result. With `auto_reconnect`, an unhealthy
/// result starts a background recovery unless one is already running.
pub struct HealthMonitor {
    server: String,
    connection: Connection,
    config: HealthCheckConfig,
    table: HealthTable,
    events: broadcast::Sender<ManagerEvent>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        server: impl Into<String>,
        connection: Connection,
        config: HealthCheckConfig,
        table: HealthTable,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            server: server.into(),
            connection,
            config,
            table,
            events,
            recovery: Mutex::new(None),
        }
    }

    /// Run the probe loop on its own task. The first probe fires immediately.
    /// Aborting the returned handle also aborts any running recovery.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            server = %self.server,
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            auto_reconnect = self.config.auto_reconnect,
            "Starting health monitor"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// Probe once, record the result and react to it.
    pub async fn tick(&self) -> ServerHealth {
        let started = Instant::now();
        let probe = AssertUnwindSafe(tokio::time::timeout(
            self.config.timeout(),
            self.connection.list_tools(),
        ))
        .catch_unwind()
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let health = match probe {
            Ok(Ok(Ok(_))) => ServerHealth::healthy(latency_ms),
            Ok(Ok(Err(e))) => ServerHealth::unhealthy(latency_ms, e.to_string()),
            Ok(Err(_)) => ServerHealth::unhealthy(latency_ms, TIMEOUT_MESSAGE),
            Err(panic) => ServerHealth::unhealthy(latency_ms, panic_message(panic.as_ref())),
        };

        if health.is_healthy() {
            debug!(server = %self.server, latency_ms, "Health check passed");
        } else {
            warn!(server = %self.server, latency_ms, errors = ?health.errors, "Health check failed");
        }

        self.table
            .write()
            .await
            .insert(self.server.clone(), health.clone());
        let _ = self.events.send(ManagerEvent::ServerHealth {
            name: self.server.clone(),
            health: health.clone(),
        });

        if !health.is_healthy() && self.config.auto_reconnect {
            self.start_recovery();
        }
        health
    }

    fn start_recovery(&self) {
        let mut slot = self.recovery.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(server = %self.server, "Recovery already in progress");
            return;
        }

        info!(server = %self.server, "Attempting recovery");
        let connection = self.connection.clone();
        let server = self.server.clone();
        let events = self.events.clone();
        *slot = Some(tokio::spawn(async move {
            let event = match connection.reconnect(0).await {
                Ok(()) => {
                    info!(server = %server, "Server recovered");
                    ManagerEvent::ServerRecovered { name: server }
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Server recovery failed");
                    ManagerEvent::ServerRecoveryFailed {
                        name: server,
                        message: e.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        }));
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.recovery.get_mut().take() {
            task.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "health check panicked".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_server_health_constructors() {
        let ok = ServerHealth::healthy(12);
        assert!(ok.is_healthy());
        assert!(ok.errors.is_empty());

        let bad = ServerHealth::unhealthy(5_000, TIMEOUT_MESSAGE);
        assert!(!bad.is_healthy());
        assert_eq!(bad.errors, vec!["Health check timeout".to_string()]);
    }

    #[test]
    fn test_server_health_serialization() {
        let json = serde_json::to_value(ServerHealth::unhealthy(7, "boom")).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["latency_ms"], 7);
        assert_eq!(json["errors"][0], "boom");
        assert!(json["last_check"].is_string());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "health check panicked");
    }
}
