//! Core type definitions for the tool-broker runtime.
//!
//! This module contains the data structures used throughout the crate,
//! organized into three groups:
//!
//! # Conversation types
//!
//! - [`Message`]: one entry of the agent conversation, with role and content
//! - [`Role`]: who produced the message (System, User, Assistant, Tool)
//! - [`ToolCall`]: a tool invocation request parsed from an LLM response
//! - [`ToolResult`]: the structured outcome fed back to the LLM
//! - [`ToolSchema`]: a tool capability declared to the LLM
//!
//! # Wire format
//!
//! Tool servers speak a JSON-framed request/response protocol: one JSON
//! document per stdout line (stdio transport) or per `message` event (SSE
//! transport). Outgoing frames are built with [`RequestFrame`]; incoming
//! frames are parsed leniently with [`IncomingFrame`] so that unknown
//! fields and unknown frame types never break the session.
//!
//! # Invocation options
//!
//! - [`InvokeOptions`]: per-call timeout and reconnect policy for
//!   [`Broker::invoke`](crate::Broker::invoke)
//! - [`ConnectionReport`]: outcome of a connectivity probe

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// CONVERSATION TYPES
// ============================================================================

/// Who produced a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the agent conversation.
///
/// Tool-role messages carry the `tool_call_id` and `name` of the call they
/// answer; assistant messages carry the `tool_calls` the model requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that requested tool calls
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Some(calls),
        }
    }

    /// Create a tool-role message answering `call_id`
    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            tool_calls: None,
        }
    }
}

/// A tool invocation parsed from an LLM response.
///
/// `arguments` is kept opaque: providers deliver it as either a JSON object
/// or a JSON-encoded string, and the agent loop decodes it at dispatch time
/// so a malformed payload becomes an error *result* instead of a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back on the matching result
    pub id: String,
    /// Tool name the model asked for
    pub name: String,
    /// Raw arguments value (object, or string containing JSON)
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Decode `arguments` into a JSON object.
    ///
    /// Accepts either an object or a string holding JSON, the two shapes
    /// providers emit. Returns `None` when neither parses to an object.
    pub fn decode_arguments(&self) -> Option<serde_json::Map<String, Value>> {
        match &self.arguments {
            Value::Object(map) => Some(map.clone()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Outcome status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Structured outcome of one tool call, fed back to the LLM.
///
/// Serialized shape: `{status, data | message, name, callId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub name: String,
    pub call_id: String,
}

impl ToolResult {
    /// Successful result carrying the server-returned data
    pub fn success(call: &ToolCall, data: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data: Some(data),
            message: None,
            name: call.name.clone(),
            call_id: call.id.clone(),
        }
    }

    /// Error result carrying a human-readable message
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            data: None,
            message: Some(message.into()),
            name: call.name.clone(),
            call_id: call.id.clone(),
        }
    }

    /// Serialize into the tool-role message appended to the conversation
    pub fn into_message(self) -> Message {
        let payload = serde_json::to_string(&self)
            .unwrap_or_else(|_| r#"{"status":"error","message":"unserializable result"}"#.into());
        Message::tool(self.call_id, self.name, payload)
    }
}

/// A tool capability declared to the LLM.
///
/// Built-ins (`query_memory`, `web_search`) and config-advertised server
/// tools share this shape; `parameters` is a JSON Schema object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Query kinds understood by the internal memory op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryQueryType {
    SemanticSearch,
    HierarchicalLookup,
}

impl FromStr for MemoryQueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic_search" => Ok(MemoryQueryType::SemanticSearch),
            "hierarchical_lookup" => Ok(MemoryQueryType::HierarchicalLookup),
            other => Err(format!("unsupported query_type: {}", other)),
        }
    }
}

impl std::fmt::Display for MemoryQueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryQueryType::SemanticSearch => write!(f, "semantic_search"),
            MemoryQueryType::HierarchicalLookup => write!(f, "hierarchical_lookup"),
        }
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// An outbound request frame.
///
/// Serializes to `{"type":"request","id":N,"payload":{...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    pub id: u64,
    pub payload: RequestPayload,
}

/// Payload of an outbound request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RequestPayload {
    /// Session handshake; first frame on every connection
    #[serde(rename = "initialize")]
    Initialize,
    /// Invoke a named tool with opaque arguments
    #[serde(rename = "callTool")]
    CallTool { name: String, arguments: Value },
}

impl RequestFrame {
    pub fn initialize(id: u64) -> Self {
        Self {
            kind: "request",
            id,
            payload: RequestPayload::Initialize,
        }
    }

    pub fn call_tool(id: u64, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            kind: "request",
            id,
            payload: RequestPayload::CallTool {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("request frame serializes")
    }
}

/// Server-reported error body on a response frame.
///
/// Only `message` is interpreted; everything else the server attaches is
/// preserved in `details` and ignored by the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// Lenient view of any inbound frame.
///
/// Unknown fields are ignored; frames whose `type` is not `response` (or
/// that lack an id) are classified as [`IncomingKind::Other`] and dropped
/// by the session demultiplexer.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<WireError>,
}

/// Classification of an inbound frame.
#[derive(Debug)]
pub enum IncomingKind {
    /// A response carrying either a result or a server error
    Response {
        id: u64,
        outcome: std::result::Result<Value, WireError>,
    },
    /// Anything else on the wire (notifications, unknown types)
    Other,
}

impl IncomingFrame {
    /// Parse one frame from its JSON document
    pub fn parse(raw: &Value) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(raw.clone())
    }

    /// Classify the frame for the demultiplexer
    pub fn classify(self) -> IncomingKind {
        match (self.kind.as_str(), self.id) {
            ("response", Some(id)) => {
                let outcome = match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                IncomingKind::Response { id, outcome }
            }
            _ => IncomingKind::Other,
        }
    }
}

// ============================================================================
// INVOCATION OPTIONS
// ============================================================================

/// Per-call options for [`Broker::invoke`](crate::Broker::invoke).
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Overall deadline for the call; `None` uses the registry default
    pub timeout: Option<Duration>,
    /// Whether the per-call path may retry failed connects
    pub allow_reconnect: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            allow_reconnect: true,
        }
    }
}

impl InvokeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_allow_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }
}

/// Outcome of a connectivity probe ([`Broker::test_connection`](crate::Broker::test_connection)).
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub ok: bool,
    pub message: String,
}
