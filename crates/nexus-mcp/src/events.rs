//! Signals broadcast by connections and by the manager.
//!
//! Each [`Connection`](crate::Connection) owns a broadcast channel of
//! [`ConnectionEvent`]s; the [`ConnectionManager`](crate::ConnectionManager)
//! owns one of [`ManagerEvent`]s and relays every connection signal into it.

use crate::health::ServerHealth;
use crate::protocol::CallToolResult;
use serde::Serialize;

/// Capacity of every event channel. Slow receivers observe `Lagged`.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected {
        server: String,
    },
    Disconnected {
        server: String,
    },
    Error {
        server: String,
        message: String,
    },
    /// `attempt` is 1-based.
    Reconnecting {
        server: String,
        attempt: u32,
        max: u32,
    },
    Reconnected {
        server: String,
    },
    ToolCalled {
        server: String,
        name: String,
        arguments: serde_json::Value,
        result: CallToolResult,
    },
    SubscriptionUpdated {
        server: String,
        uri: String,
        contents: serde_json::Value,
    },
    /// Any other unsolicited notification.
    Notification {
        server: String,
        method: String,
        params: serde_json::Value,
    },
}

impl ConnectionEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::Connected { server }
            | Self::Disconnected { server }
            | Self::Error { server, .. }
            | Self::Reconnecting { server, .. }
            | Self::Reconnected { server }
            | Self::ToolCalled { server, .. }
            | Self::SubscriptionUpdated { server, .. }
            | Self::Notification { server, .. } => server,
        }
    }

    /// Signal name as used on the wire, e.g. `"tool_called"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected { .. } => "reconnected",
            Self::ToolCalled { .. } => "tool_called",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::Notification { .. } => "notification",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    ServerConnected { name: String },
    ServerDisconnected { name: String },
    ServerError { name: String, message: String },
    ServerHealth { name: String, health: ServerHealth },
    ServerRecovered { name: String },
    ServerRecoveryFailed { name: String, message: String },
    /// A signal emitted by one of the managed connections.
    Relayed { signal: ConnectionEvent },
}
