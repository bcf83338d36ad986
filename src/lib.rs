//! # Tool Broker - Agent Runtime for External Tool Servers
//!
//! An async runtime that drives an LLM through an iterative tool-use loop
//! against external *tool servers* speaking a JSON-framed protocol over
//! either line-delimited stdio (child processes) or Server-Sent Events
//! (HTTP).
//!
//! ## Key Features
//!
//! - **Transport-agnostic broker**: one `invoke(server, tool, args)` call,
//!   whether the server is a supervised child process or a per-call HTTP
//!   stream
//! - **Process supervision**: managed stdio servers are spawned, stderr-
//!   captured, and restarted with bounded linear backoff
//! - **Correlation-id sessions**: concurrent calls multiplex over one
//!   connection; every request gets exactly one terminal outcome
//! - **Bounded agent loop**: tool calls execute in declaration order and
//!   the loop halts at a hard iteration cap
//! - **Cooperative cancellation**: every blocking operation takes a
//!   deadline and a cancellation token
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tool_broker::{Broker, BrokerSettings, ConfigRegistry, InvokeOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ConfigRegistry::from_json_str(r#"{
//!         "mcp_servers": {
//!             "exa_sse": { "transport": "sse", "url": "http://localhost:7310/sse" }
//!         }
//!     }"#)?);
//!
//!     let broker = Broker::new(registry, BrokerSettings::default());
//!     for issue in broker.validate_config() {
//!         eprintln!("config: {}", issue);
//!     }
//!
//!     let result = broker
//!         .invoke(
//!             "exa_sse",
//!             "echo",
//!             serde_json::json!({ "q": "hi" }),
//!             InvokeOptions::default(),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into one module per subsystem:
//!
//! - **transport**: framed send/receive over stdio lines or SSE events
//! - **client**: one session per connection; handshake, correlation ids,
//!   deadlines, cancellation
//! - **supervisor**: lifecycle of managed stdio children; restart with
//!   backoff; stderr capture
//! - **broker**: the public facade routing managed vs per-call paths
//! - **agent**: the bounded LLM↔tools controller
//! - **config**: descriptor parsing, validation, generation-swapped
//!   registry
//! - **error**: the crate-wide error taxonomy
//! - **retry**: backoff curves shared by supervisor and broker

mod agent;
mod broker;
mod client;
mod config;
mod error;
mod supervisor;
mod transport;
mod types;

/// Backoff curves and the generic retry helper.
/// Public so embedders can reuse the same policies for their own calls.
pub mod retry;

// --- Broker facade ---

pub use broker::{Broker, BrokerSettings};

// --- Agent loop ---

pub use agent::{AgentLoop, ChatTurn, LlmClient, MAX_TOOL_ITERATIONS, MEMORY_TOOL, MemoryStore};

// --- Sessions & transports ---

pub use client::{ClientSettings, ClientState, ToolClient};
pub use transport::{
    SseTransport, StderrLine, StdioTransport, Transport, TransportEvent, normalize_localhost,
};

// --- Supervision ---

pub use supervisor::{ManagedState, ManagedStatus, Supervisor, SupervisorSettings};

// --- Configuration ---

pub use config::{
    ConfigIssue, ConfigRegistry, Generation, ServerDescriptor, StderrPolicy, TransportKind,
    inherited_env_baseline,
};

// --- Core types ---

pub use types::{
    ConnectionReport, IncomingFrame, IncomingKind, InvokeOptions, MemoryQueryType, Message,
    RequestFrame, RequestPayload, Role, ToolCall, ToolResult, ToolSchema, ToolStatus, WireError,
};

// --- Error handling ---

pub use error::{Error, Result};

/// Convenience module containing the most commonly used types.
/// Import with `use tool_broker::prelude::*;` for typical usage.
pub mod prelude {
    pub use crate::{
        AgentLoop, Broker, BrokerSettings, ChatTurn, ConfigRegistry, Error, InvokeOptions,
        LlmClient, MemoryStore, Message, Result, Role, ToolCall, ToolResult, ToolSchema,
    };
}
