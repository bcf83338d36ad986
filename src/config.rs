//! # Server configuration for the tool-broker runtime
//!
//! This module parses and validates the configuration document describing
//! the tool servers the broker can reach. The document is a JSON object:
//!
//! ```json
//! {
//!   "mcp_servers": {
//!     "exa_sse":   { "transport": "sse", "url": "http://localhost:7310/sse" },
//!     "exa_stdio": { "transport": "stdio", "command": "exa-server",
//!                    "args": ["--quiet"], "manageProcess": true }
//!   },
//!   "mcpClientDefaultTimeoutMs": 30000
//! }
//! ```
//!
//! ## Generations
//!
//! Each successful load produces an immutable *generation*. Readers take a
//! cheap `Arc` snapshot; a reload swaps the generation atomically, so a
//! descriptor resolved at the start of a call stays valid for that call
//! even if the configuration changes mid-flight.
//!
//! ## Validation
//!
//! Every descriptor is validated on load. Invalid entries stay visible to
//! [`ConfigRegistry::validate`] (so operators can see what is wrong) but
//! are not servable: resolving one yields a configuration error instead of
//! a connection attempt.

use crate::types::ToolSchema;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Fallback per-call timeout when the document does not set one.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// DESCRIPTOR TYPES
// ============================================================================

/// How to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON on stdio
    Stdio,
    /// HTTP Server-Sent Events stream with a companion POST endpoint
    Sse,
    /// Reserved; descriptors using it are rejected at validation
    Websocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Websocket => write!(f, "websocket"),
        }
    }
}

/// What to do with a stdio child's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Capture stderr and forward each line to the diagnostic sink
    #[default]
    Pipe,
    /// Let the child write to the parent's stderr directly
    Inherit,
}

/// Identity and reachability of one tool server.
///
/// Constructed at config load and immutable for the lifetime of its
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Unique id, stable across reloads; filled from the document key
    #[serde(skip)]
    pub id: String,

    /// Informational name for operator-facing surfaces
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    pub transport: TransportKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Absolute URL of the SSE stream (sse transport only)
    #[serde(default)]
    pub url: Option<String>,

    /// Executable to spawn (stdio transport only)
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Overlay on the curated inherited environment baseline
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub stderr_behavior: StderrPolicy,

    /// Whether the supervisor owns this server's lifecycle
    #[serde(default)]
    pub manage_process: bool,

    /// Tool capabilities this server advertises to the agent loop
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    /// The stdio child environment: curated inherited baseline with the
    /// descriptor's `env` overlaid (descriptor wins on conflicts).
    pub fn child_env(&self) -> HashMap<String, String> {
        let mut env = inherited_env_baseline();
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// A curated subset of the parent environment that stdio children inherit.
///
/// Only well-known, non-secret variables pass through; everything else the
/// child needs must be stated in the descriptor's `env`.
pub fn inherited_env_baseline() -> HashMap<String, String> {
    #[cfg(unix)]
    const ALLOWED: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];
    #[cfg(windows)]
    const ALLOWED: &[&str] = &[
        "APPDATA",
        "HOMEDRIVE",
        "HOMEPATH",
        "LOCALAPPDATA",
        "PATH",
        "PROCESSOR_ARCHITECTURE",
        "SYSTEMDRIVE",
        "SYSTEMROOT",
        "TEMP",
        "USERNAME",
        "USERPROFILE",
    ];

    ALLOWED
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect()
}

// ============================================================================
// VALIDATION
// ============================================================================

/// One problem found while validating a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub server_id: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.server_id, self.message)
    }
}

fn validate_descriptor(desc: &ServerDescriptor) -> Vec<ConfigIssue> {
    let issue = |message: String| ConfigIssue {
        server_id: desc.id.clone(),
        message,
    };
    let mut issues = Vec::new();

    match desc.transport {
        TransportKind::Sse => {
            match desc.url.as_deref() {
                None | Some("") => {
                    issues.push(issue("Missing 'url' for sse transport".to_string()));
                }
                Some(url) => match reqwest::Url::parse(url) {
                    Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
                    Ok(parsed) => issues.push(issue(format!(
                        "unsupported url scheme '{}' (expected http or https)",
                        parsed.scheme()
                    ))),
                    Err(err) => issues.push(issue(format!("invalid url '{}': {}", url, err))),
                },
            }
            if desc.manage_process {
                issues.push(issue(
                    "manageProcess requires the stdio transport".to_string(),
                ));
            }
        }
        TransportKind::Stdio => {
            if desc.command.as_deref().unwrap_or("").trim().is_empty() {
                issues.push(issue("Missing 'command' for stdio transport".to_string()));
            }
        }
        TransportKind::Websocket => {
            issues.push(issue(
                "transport 'websocket' is reserved and not supported".to_string(),
            ));
        }
    }

    issues
}

// ============================================================================
// DOCUMENT & REGISTRY
// ============================================================================

/// Raw shape of the configuration document.
#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    mcp_servers: HashMap<String, ServerDescriptor>,
    #[serde(rename = "mcpClientDefaultTimeoutMs", default)]
    mcp_client_default_timeout_ms: Option<u64>,
    #[serde(rename = "logUnmatchedResponses", default = "default_true")]
    log_unmatched_responses: bool,
}

/// One immutable load of the configuration.
#[derive(Debug)]
pub struct Generation {
    serial: u64,
    descriptors: HashMap<String, Arc<ServerDescriptor>>,
    issues: Vec<ConfigIssue>,
    invalid: HashSet<String>,
    default_timeout: Duration,
    log_unmatched_responses: bool,
}

impl Generation {
    fn from_document(serial: u64, doc: ConfigDocument) -> Self {
        let mut descriptors = HashMap::new();
        let mut issues = Vec::new();
        let mut invalid = HashSet::new();

        // Sorted so issue order is stable across loads
        let mut entries: Vec<_> = doc.mcp_servers.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, mut desc) in entries {
            desc.id = id.clone();
            // Disabled entries keep their issues visible but are never servable anyway
            if desc.enabled {
                let found = validate_descriptor(&desc);
                if !found.is_empty() {
                    invalid.insert(id.clone());
                    issues.extend(found);
                }
            }
            descriptors.insert(id, Arc::new(desc));
        }

        Self {
            serial,
            descriptors,
            issues,
            invalid,
            default_timeout: Duration::from_millis(
                doc.mcp_client_default_timeout_ms
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
            ),
            log_unmatched_responses: doc.log_unmatched_responses,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn log_unmatched_responses(&self) -> bool {
        self.log_unmatched_responses
    }

    pub fn issues(&self) -> &[ConfigIssue] {
        &self.issues
    }

    /// Every descriptor in this generation, including invalid and disabled ones
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ServerDescriptor>> {
        self.descriptors.values()
    }

    /// Look up a descriptor without applying boundary rules
    pub fn get(&self, id: &str) -> Option<Arc<ServerDescriptor>> {
        self.descriptors.get(id).cloned()
    }

    /// Resolve a descriptor for serving, applying the broker boundary rules.
    pub fn resolve(&self, id: &str) -> Result<Arc<ServerDescriptor>> {
        let desc = self.get(id).ok_or_else(|| Error::server_unknown(id))?;
        if !desc.enabled {
            return Err(Error::server_disabled(id));
        }
        if self.invalid.contains(id) {
            return Err(Error::config(format!(
                "server '{}' failed validation; see validate_config()",
                id
            )));
        }
        Ok(desc)
    }

    /// Descriptors the supervisor should own.
    pub fn managed(&self) -> Vec<Arc<ServerDescriptor>> {
        let mut out: Vec<_> = self
            .descriptors
            .values()
            .filter(|d| d.enabled && d.manage_process && !self.invalid.contains(&d.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Tool capabilities advertised by servable descriptors, for injection
    /// into the LLM tool schema set.
    pub fn advertised_tools(&self) -> Vec<ToolSchema> {
        let mut out = Vec::new();
        let mut ids: Vec<_> = self.descriptors.keys().collect();
        ids.sort();
        for id in ids {
            let desc = &self.descriptors[id];
            if desc.enabled && !self.invalid.contains(id) {
                out.extend(desc.tools.iter().cloned());
            }
        }
        out
    }
}

/// Registry of server descriptors with atomic generation replacement.
#[derive(Debug)]
pub struct ConfigRegistry {
    current: RwLock<Arc<Generation>>,
    next_serial: std::sync::atomic::AtomicU64,
}

impl ConfigRegistry {
    /// Load a registry from a JSON document string.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("configuration is not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Load a registry from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let doc: ConfigDocument = serde_json::from_value(value)
            .map_err(|e| Error::config(format!("configuration has unexpected shape: {}", e)))?;
        let generation = Arc::new(Generation::from_document(1, doc));
        Ok(Self {
            current: RwLock::new(generation),
            next_serial: std::sync::atomic::AtomicU64::new(2),
        })
    }

    /// An empty registry (no servers). Useful for loops that only use
    /// internal memory tools.
    pub fn empty() -> Self {
        Self::from_value(serde_json::json!({ "mcp_servers": {} }))
            .expect("empty config document is valid")
    }

    /// Replace the current generation atomically.
    ///
    /// A parse failure leaves the previous generation in place.
    pub fn reload(&self, value: serde_json::Value) -> Result<u64> {
        let doc: ConfigDocument = serde_json::from_value(value)
            .map_err(|e| Error::config(format!("configuration has unexpected shape: {}", e)))?;
        let serial = self
            .next_serial
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let generation = Arc::new(Generation::from_document(serial, doc));
        *self.current.write().expect("config lock poisoned") = generation;
        log::info!(target: "tool_broker::config", "configuration reloaded (generation {})", serial);
        Ok(serial)
    }

    /// A snapshot of the current generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// All validation issues of the current generation.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        self.snapshot().issues().to_vec()
    }
}
