//! Error types for the tool-broker runtime

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime.
///
/// Every surfaced error carries enough context (`server_id`, `tool_name`)
/// for an operator to tell configuration problems, infrastructure faults
/// and server-reported failures apart.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration document malformed or a descriptor violates its invariants
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No descriptor with this id in the current config generation
    #[error("unknown tool server '{server_id}'")]
    ServerUnknown { server_id: String },

    /// Descriptor exists but is disabled
    #[error("tool server '{server_id}' is disabled")]
    ServerDisabled { server_id: String },

    /// Managed server has no live connection right now
    #[error("tool server '{server_id}' is unavailable: {reason}")]
    ServerUnavailable { server_id: String, reason: String },

    /// Protocol handshake did not complete
    #[error("handshake with '{server_id}' failed: {reason}")]
    HandshakeFailed { server_id: String, reason: String },

    /// The transport closed while requests were outstanding
    #[error("connection to '{server_id}' closed")]
    ConnectionClosed { server_id: String },

    /// A frame on the wire was not a well-formed JSON document
    #[error("frame parse error from '{server_id}': {reason}")]
    FrameParse { server_id: String, reason: String },

    /// The tool server reported an error payload; the message is preserved verbatim
    #[error("tool '{tool_name}' on '{server_id}' failed: {message}")]
    ToolInvocationFailed {
        server_id: String,
        tool_name: String,
        message: String,
    },

    /// A deadline elapsed on the operation that owned it
    #[error("operation timed out")]
    TimedOut,

    /// Cooperative cancellation was requested
    #[error("operation cancelled")]
    Cancelled,

    /// The agent loop reached its iteration cap without a final answer
    #[error("iteration cap reached after {iterations} tool iterations")]
    IterationCapReached { iterations: u32 },

    /// The memory collaborator failed
    #[error("memory query failed: {0}")]
    Memory(String),

    /// Underlying I/O failure (spawn, pipe, socket)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error (SSE transport)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    /// Create a new unknown-server error
    pub fn server_unknown(server_id: impl Into<String>) -> Self {
        Error::ServerUnknown {
            server_id: server_id.into(),
        }
    }

    /// Create a new disabled-server error
    pub fn server_disabled(server_id: impl Into<String>) -> Self {
        Error::ServerDisabled {
            server_id: server_id.into(),
        }
    }

    /// Create a new unavailable-server error
    pub fn server_unavailable(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ServerUnavailable {
            server_id: server_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new handshake error
    pub fn handshake(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::HandshakeFailed {
            server_id: server_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new connection-closed error
    pub fn connection_closed(server_id: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            server_id: server_id.into(),
        }
    }

    /// Create a new frame-parse error
    pub fn frame_parse(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::FrameParse {
            server_id: server_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new tool-invocation error carrying the server-reported message
    pub fn tool_failed(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::ToolInvocationFailed {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a new memory error
    pub fn memory(msg: impl Into<String>) -> Self {
        Error::Memory(msg.into())
    }

    /// True for faults that happen while establishing a connection.
    ///
    /// The broker's per-call reconnect policy retries exactly these; tool
    /// invocation errors and boundary rejections are terminal.
    pub fn is_connect_fault(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed { .. }
                | Error::ConnectionClosed { .. }
                | Error::Io(_)
                | Error::Http(_)
        )
    }
}
