use serde::Serialize;
use thiserror::Error;

/// A convenience `Result` alias using [`NexusError`].
pub type NexusResult<T> = Result<T, NexusError>;

/// Machine-readable classification attached to every [`NexusError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad caller input.
    InvalidParams,
    /// Operation attempted while the session is not connected.
    NotConnected,
    /// A local deadline elapsed before a response arrived.
    Timeout,
    /// The reconnection budget is exhausted.
    MaxRetries,
    /// The underlying channel failed.
    TransportError,
    /// The session was torn down while the request was outstanding.
    ConnectionClosed,
    /// The server answered with a JSON-RPC error object.
    ServerError,
    /// A message did not have the expected shape.
    ProtocolError,
    /// A tool or server lookup found nothing.
    NotFound,
    /// Configuration could not be parsed or validated.
    ConfigurationError,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// The wire representation, e.g. `"NOT_CONNECTED"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "INVALID_PARAMS",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout => "TIMEOUT",
            Self::MaxRetries => "MAX_RETRIES",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ServerError => "SERVER_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the nexus connection core.
#[derive(Error, Debug)]
pub enum NexusError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Server '{server}' is not connected (state: {state})")]
    NotConnected { server: String, state: String },

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Server '{server}' unreachable after {attempts} reconnection attempts")]
    MaxRetries { server: String, attempts: u32 },

    #[error("Transport error for server '{server}': {message}")]
    Transport {
        server: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    #[error("Server error [{code}]: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("Unknown server: '{0}'")]
    UnknownServer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NexusError {
    /// Shorthand for a [`NexusError::Transport`] without a nested cause.
    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a [`NexusError::Protocol`] wrapping a parse failure.
    pub fn protocol(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::NotConnected { .. } => ErrorCode::NotConnected,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::MaxRetries { .. } => ErrorCode::MaxRetries,
            Self::Transport { .. } => ErrorCode::TransportError,
            Self::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            Self::Rpc { .. } => ErrorCode::ServerError,
            Self::Protocol { .. } | Self::Json(_) => ErrorCode::ProtocolError,
            Self::UnknownTool(_) | Self::UnknownServer(_) => ErrorCode::NotFound,
            Self::Config(_) => ErrorCode::ConfigurationError,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    ///
    /// The connection itself never retries individual requests; this is a
    /// hint for callers sitting above it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Transport { .. }
                | Self::ConnectionClosed { .. }
                | Self::NotConnected { .. }
        )
    }

    /// Render as `{code, message, cause}` for callers that speak JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let cause = std::error::Error::source(self).map(ToString::to_string);
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "cause": cause,
        })
    }
}
