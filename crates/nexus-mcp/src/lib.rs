//! MCP client core: resilient per-server connections, a tool-routing
//! connection manager and per-server health monitoring.

pub mod config;
pub mod connection;
pub mod events;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use config::{HealthCheckConfig, NexusConfig, ServerConfig, TransportConfig};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use events::{ConnectionEvent, ManagerEvent};
pub use health::{HealthMonitor, HealthStatus, ServerHealth};
pub use manager::{CatalogTool, ConnectionManager, ServerStatus};
pub use transport::{
    StdioTransport, StdioTransportFactory, Transport, TransportEvent, TransportFactory,
};
