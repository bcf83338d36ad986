//! Public facade turning `(server id, tool, arguments)` into an executed
//! call, independent of transport and managed/unmanaged path.
//!
//! The broker resolves the descriptor at its boundary (rejecting unknown,
//! disabled and invalid entries), then routes:
//!
//! - **Managed** servers: fetch the live session from the [`Supervisor`];
//!   if there is none right now the call fails with `ServerUnavailable`
//!   and the supervisor's restart machinery stays in charge.
//! - **Unmanaged** servers: build a fresh transport and session for this
//!   one call and tear it down before returning, on every path. Connect
//!   failures (only) are retried up to `max_reconnect_attempts`, spaced
//!   `reconnect_delay` apart, unless the caller disallowed reconnects or
//!   the deadline ran out. Tool errors are reported verbatim, never
//!   retried.
//!
//! Concurrent invocations against different servers proceed in parallel;
//! concurrent invocations against the same managed server multiplex over
//! the one live session via correlation ids.

use crate::client::{ClientSettings, ToolClient};
use crate::config::{ConfigIssue, ConfigRegistry, ServerDescriptor, TransportKind};
use crate::supervisor::{ManagedState, Supervisor, SupervisorSettings};
use crate::transport::{SseTransport, StdioTransport, Transport};
use crate::types::{ConnectionReport, InvokeOptions};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Tunables for the broker.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Connect retries per unmanaged invocation (total connects = this + 1)
    pub max_reconnect_attempts: u32,
    /// Spacing between those connect retries
    pub reconnect_delay: Duration,
    /// Settings handed to the owned supervisor
    pub supervisor: SupervisorSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            supervisor: SupervisorSettings::default(),
        }
    }
}

/// The tool-server broker.
pub struct Broker {
    registry: Arc<ConfigRegistry>,
    supervisor: Arc<Supervisor>,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(registry: Arc<ConfigRegistry>, settings: BrokerSettings) -> Self {
        let supervisor = Arc::new(Supervisor::new(registry.clone(), settings.supervisor.clone()));
        Self {
            registry,
            supervisor,
            settings,
        }
    }

    /// The configuration registry this broker serves from.
    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    /// The supervisor owning this broker's managed servers.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Start every managed tool server (non-blocking).
    pub fn start_managed(&self) {
        self.supervisor.start_managed();
    }

    /// Stop every managed tool server. Idempotent.
    pub async fn stop_managed(&self) {
        self.supervisor.stop_managed().await;
    }

    /// Validation issues for the current configuration generation.
    pub fn validate_config(&self) -> Vec<ConfigIssue> {
        self.registry.validate()
    }

    /// Invoke `tool_name` on the server `server_id`.
    pub async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        options: InvokeOptions,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let snapshot = self.registry.snapshot();
        let descriptor = snapshot.resolve(server_id)?;
        let timeout = options.timeout.unwrap_or_else(|| snapshot.default_timeout());
        let deadline = Instant::now() + timeout;

        if descriptor.manage_process {
            let client = self.supervisor.get(server_id).ok_or_else(|| {
                let reason = match self.supervisor.status(server_id) {
                    Some(status) => format!("managed entry is {:?}", status.state),
                    None => "managed entry not started".to_string(),
                };
                Error::server_unavailable(server_id, reason)
            })?;
            return client
                .call_tool(tool_name, arguments, remaining(deadline)?, cancel)
                .await;
        }

        self.invoke_per_call(&descriptor, tool_name, arguments, &options, deadline, cancel)
            .await
    }

    /// One-shot path: fresh session per call, torn down on every outcome.
    async fn invoke_per_call(
        &self,
        descriptor: &Arc<ServerDescriptor>,
        tool_name: &str,
        arguments: Value,
        options: &InvokeOptions,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let settings = ClientSettings {
            log_unmatched_responses: self.registry.snapshot().log_unmatched_responses(),
        };
        let mut failed_connects: u32 = 0;

        loop {
            let connect_budget = remaining(deadline)?;
            let transport = build_transport(descriptor)?;
            let client = ToolClient::new(&descriptor.id, transport, settings.clone());

            match client.connect(connect_budget, cancel).await {
                Ok(()) => {
                    let result = match remaining(deadline) {
                        Ok(budget) => {
                            client.call_tool(tool_name, arguments, budget, cancel).await
                        }
                        Err(err) => Err(err),
                    };
                    // Scoped release: the per-call session never outlives
                    // the invocation, success or not
                    client.disconnect().await;
                    return result;
                }
                Err(err) => {
                    client.disconnect().await;

                    failed_connects += 1;
                    let may_retry = options.allow_reconnect
                        && err.is_connect_fault()
                        && failed_connects <= self.settings.max_reconnect_attempts
                        && remaining(deadline).is_ok();
                    if !may_retry {
                        return Err(err);
                    }

                    log::info!(
                        target: "tool_broker::broker",
                        "[{}] connect failed ({}); retry {}/{}",
                        descriptor.id,
                        err,
                        failed_connects,
                        self.settings.max_reconnect_attempts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    /// Probe connectivity of a server.
    ///
    /// Managed servers report their cached supervisor state without
    /// opening a new connection; unmanaged servers get a one-shot
    /// connect-then-disconnect. Never returns `Err`: every failure mode
    /// lands in the report.
    pub async fn test_connection(
        &self,
        server_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ConnectionReport {
        let snapshot = self.registry.snapshot();
        let descriptor = match snapshot.resolve(server_id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                return ConnectionReport {
                    ok: false,
                    message: err.to_string(),
                };
            }
        };

        if descriptor.manage_process {
            return match self.supervisor.status(server_id) {
                Some(status) => ConnectionReport {
                    ok: status.state == ManagedState::Connected,
                    message: match status.last_error {
                        Some(err) => format!("state {:?}: {}", status.state, err),
                        None => format!("state {:?}", status.state),
                    },
                },
                None => ConnectionReport {
                    ok: false,
                    message: "managed entry not started".to_string(),
                },
            };
        }

        let deadline = timeout.unwrap_or_else(|| snapshot.default_timeout());
        let transport = match build_transport(&descriptor) {
            Ok(transport) => transport,
            Err(err) => {
                return ConnectionReport {
                    ok: false,
                    message: err.to_string(),
                };
            }
        };
        let client = ToolClient::new(&descriptor.id, transport, ClientSettings::default());
        let report = match client.connect(deadline, cancel).await {
            Ok(()) => ConnectionReport {
                ok: true,
                message: "connected".to_string(),
            },
            Err(err) => ConnectionReport {
                ok: false,
                message: err.to_string(),
            },
        };
        client.disconnect().await;
        report
    }
}

fn build_transport(descriptor: &Arc<ServerDescriptor>) -> Result<Box<dyn Transport>> {
    match descriptor.transport {
        TransportKind::Stdio => Ok(Box::new(StdioTransport::new(descriptor.clone()))),
        TransportKind::Sse => Ok(Box::new(SseTransport::new(descriptor)?)),
        TransportKind::Websocket => Err(Error::config(format!(
            "server '{}': transport 'websocket' is reserved and not supported",
            descriptor.id
        ))),
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::TimedOut);
    }
    Ok(deadline - now)
}
