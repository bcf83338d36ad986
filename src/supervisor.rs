//! Lifecycle supervision of managed stdio tool servers.
//!
//! Descriptors with `manageProcess: true` get a long-lived child process
//! owned by the [`Supervisor`]: it spawns the child, completes the session
//! handshake, captures stderr, detects crash or close, restarts with a
//! bounded backoff, and tears everything down on shutdown.
//!
//! Each managed server runs its own supervise task; that task is the only
//! writer of the server's [`ManagedEntry`]. External readers get
//! snapshots ([`Supervisor::status`]) or a live client reference
//! ([`Supervisor::get`]); they never see a partially-initialized session.
//!
//! Restart policy: after a failed connect or a lost connection the
//! attempt counter increments; past `max_restart_attempts` the entry
//! stops for good. The delay before attempt *n* is
//! `restart_base_delay × n` (linear, the default curve), and every delay
//! is preempted by [`Supervisor::stop_managed`].

use crate::client::{ClientSettings, ClientState, ToolClient};
use crate::config::{ConfigRegistry, ServerDescriptor};
use crate::retry::{BackoffCurve, RetryConfig};
use crate::transport::{STDERR_CHANNEL_CAPACITY, StderrLine, StdioTransport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Restarts allowed per entry over its lifetime (total starts = this + 1)
    pub max_restart_attempts: u32,
    /// Base of the restart delay curve
    pub restart_base_delay: Duration,
    /// Restart delay growth; linear matches the observed source behavior
    pub restart_curve: BackoffCurve,
    /// Deadline for spawn + handshake on each start
    pub connect_timeout: Duration,
    /// How long `stop_managed` waits for supervise tasks to wind down
    pub shutdown_budget: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_base_delay: Duration::from_secs(5),
            restart_curve: BackoffCurve::Linear,
            connect_timeout: Duration::from_secs(10),
            shutdown_budget: Duration::from_secs(5),
        }
    }
}

impl SupervisorSettings {
    fn delay_for(&self, attempt: u32) -> Duration {
        RetryConfig::new()
            .with_base_delay(self.restart_base_delay)
            .with_curve(self.restart_curve)
            .delay_for(attempt)
    }
}

/// Where a managed server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedState {
    /// Spawning and handshaking
    Starting,
    /// Live session; `get` returns its client
    Connected,
    /// Lost; waiting out the restart delay
    Degraded,
    /// Given up or shut down
    Stopped,
}

/// Snapshot of one managed server for external readers.
#[derive(Debug, Clone)]
pub struct ManagedStatus {
    pub server_id: String,
    pub state: ManagedState,
    pub attempt: u32,
    pub last_error: Option<String>,
}

struct ManagedEntry {
    state: ManagedState,
    attempt: u32,
    last_error: Option<String>,
    client: Option<Arc<ToolClient>>,
}

type EntryMap = Arc<Mutex<HashMap<String, ManagedEntry>>>;

/// Owner of all managed tool-server processes.
pub struct Supervisor {
    registry: Arc<ConfigRegistry>,
    entries: EntryMap,
    stderr_tx: broadcast::Sender<StderrLine>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(registry: Arc<ConfigRegistry>, settings: SupervisorSettings) -> Self {
        let (stderr_tx, _) = broadcast::channel(STDERR_CHANNEL_CAPACITY);
        Self {
            registry,
            entries: Arc::new(Mutex::new(HashMap::new())),
            stderr_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            settings,
        }
    }

    /// Subscribe to captured stderr lines from all managed children.
    ///
    /// The channel is bounded; subscribers that fall behind lose the
    /// oldest lines rather than ever blocking a child.
    pub fn stderr_lines(&self) -> broadcast::Receiver<StderrLine> {
        self.stderr_tx.subscribe()
    }

    /// Spawn and connect every managed descriptor, without blocking the
    /// caller on slow servers.
    ///
    /// Ids that already have an entry are left alone, so there is never
    /// more than one live entry per id.
    pub fn start_managed(&self) {
        if self.shutdown.is_cancelled() {
            log::warn!(
                target: "tool_broker::supervisor",
                "start_managed after stop_managed is a no-op"
            );
            return;
        }

        for descriptor in self.registry.snapshot().managed() {
            let id = descriptor.id.clone();
            {
                let mut entries = self.entries.lock().expect("entry lock poisoned");
                if entries.contains_key(&id) {
                    continue;
                }
                entries.insert(
                    id.clone(),
                    ManagedEntry {
                        state: ManagedState::Starting,
                        attempt: 0,
                        last_error: None,
                        client: None,
                    },
                );
            }

            let task = tokio::spawn(supervise(
                descriptor,
                self.entries.clone(),
                self.stderr_tx.clone(),
                self.registry.clone(),
                self.shutdown.child_token(),
                self.settings.clone(),
            ));
            self.tasks.lock().expect("task lock poisoned").push(task);
        }
    }

    /// A live client for the given id, only while its session is connected.
    pub fn get(&self, id: &str) -> Option<Arc<ToolClient>> {
        let entries = self.entries.lock().expect("entry lock poisoned");
        let entry = entries.get(id)?;
        if entry.state != ManagedState::Connected {
            return None;
        }
        let client = entry.client.clone()?;
        // The session may have died between the supervise task noticing
        // and this read; trust the client's own state
        if client.state() == ClientState::Connected {
            Some(client)
        } else {
            None
        }
    }

    /// Snapshot of one managed entry.
    pub fn status(&self, id: &str) -> Option<ManagedStatus> {
        let entries = self.entries.lock().expect("entry lock poisoned");
        entries.get(id).map(|entry| ManagedStatus {
            server_id: id.to_string(),
            state: entry.state,
            attempt: entry.attempt,
            last_error: entry.last_error.clone(),
        })
    }

    /// Snapshots of every managed entry.
    pub fn statuses(&self) -> Vec<ManagedStatus> {
        let entries = self.entries.lock().expect("entry lock poisoned");
        let mut out: Vec<_> = entries
            .iter()
            .map(|(id, entry)| ManagedStatus {
                server_id: id.clone(),
                state: entry.state,
                attempt: entry.attempt,
                last_error: entry.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }

    /// Disconnect every managed server and destroy its entry.
    ///
    /// Preempts in-flight restart delays, waits up to the shutdown budget
    /// for supervise tasks to finish, and is idempotent.
    pub async fn stop_managed(&self) {
        self.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
            .collect();
        let deadline = tokio::time::Instant::now() + self.settings.shutdown_budget;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                log::warn!(
                    target: "tool_broker::supervisor",
                    "shutdown budget elapsed with a supervise task still running"
                );
                task.abort();
            }
        }

        // Belt and braces: disconnect anything a task left behind
        let clients: Vec<_> = {
            let mut entries = self.entries.lock().expect("entry lock poisoned");
            let clients = entries
                .values_mut()
                .filter_map(|entry| entry.client.take())
                .collect();
            entries.clear();
            clients
        };
        for client in clients {
            client.disconnect().await;
        }
    }
}

fn update_entry(
    entries: &EntryMap,
    id: &str,
    f: impl FnOnce(&mut ManagedEntry),
) {
    let mut entries = entries.lock().expect("entry lock poisoned");
    if let Some(entry) = entries.get_mut(id) {
        f(entry);
    }
}

/// Per-server supervise loop; the single writer of this id's entry.
async fn supervise(
    descriptor: Arc<ServerDescriptor>,
    entries: EntryMap,
    stderr_tx: broadcast::Sender<StderrLine>,
    registry: Arc<ConfigRegistry>,
    shutdown: CancellationToken,
    settings: SupervisorSettings,
) {
    let id = descriptor.id.clone();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            update_entry(&entries, &id, |e| {
                e.state = ManagedState::Stopped;
                e.client = None;
            });
            return;
        }

        // Destroy whatever was there before this (re)start
        update_entry(&entries, &id, |e| {
            e.state = ManagedState::Starting;
            e.attempt = attempt;
            e.client = None;
        });

        let transport =
            StdioTransport::new(descriptor.clone()).with_stderr_sink(stderr_tx.clone());
        let client = Arc::new(ToolClient::new(
            &id,
            Box::new(transport),
            ClientSettings {
                log_unmatched_responses: registry.snapshot().log_unmatched_responses(),
            },
        ));

        match client.connect(settings.connect_timeout, &shutdown).await {
            Ok(()) => {
                log::info!(
                    target: "tool_broker::supervisor",
                    "[{}] connected (start {})",
                    id,
                    attempt + 1
                );
                update_entry(&entries, &id, |e| {
                    e.state = ManagedState::Connected;
                    e.last_error = None;
                    e.client = Some(client.clone());
                });

                tokio::select! {
                    _ = client.closed() => {
                        log::warn!(
                            target: "tool_broker::supervisor",
                            "[{}] connection lost",
                            id
                        );
                        update_entry(&entries, &id, |e| {
                            e.state = ManagedState::Degraded;
                            e.last_error = Some("connection closed".to_string());
                            e.client = None;
                        });
                    }
                    _ = shutdown.cancelled() => {
                        client.disconnect().await;
                        update_entry(&entries, &id, |e| {
                            e.state = ManagedState::Stopped;
                            e.client = None;
                        });
                        return;
                    }
                }
            }
            Err(crate::Error::Cancelled) => {
                client.disconnect().await;
                update_entry(&entries, &id, |e| {
                    e.state = ManagedState::Stopped;
                    e.client = None;
                });
                return;
            }
            Err(err) => {
                log::warn!(
                    target: "tool_broker::supervisor",
                    "[{}] connect failed: {}",
                    id,
                    err
                );
                update_entry(&entries, &id, |e| {
                    e.state = ManagedState::Degraded;
                    e.last_error = Some(err.to_string());
                    e.client = None;
                });
            }
        }

        attempt += 1;
        if attempt > settings.max_restart_attempts {
            log::error!(
                target: "tool_broker::supervisor",
                "[{}] giving up after {} restart attempts",
                id,
                settings.max_restart_attempts
            );
            update_entry(&entries, &id, |e| {
                e.state = ManagedState::Stopped;
                e.attempt = attempt;
                e.last_error
                    .get_or_insert_with(|| "restart attempts exhausted".to_string());
            });
            return;
        }

        let delay = settings.delay_for(attempt);
        log::info!(
            target: "tool_broker::supervisor",
            "[{}] restarting in {:?} (attempt {}/{})",
            id,
            delay,
            attempt,
            settings.max_restart_attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                update_entry(&entries, &id, |e| {
                    e.state = ManagedState::Stopped;
                    e.client = None;
                });
                return;
            }
        }
    }
}
