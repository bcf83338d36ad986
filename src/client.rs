//! One logical session to a tool server.
//!
//! A [`ToolClient`] drives the JSON request/response protocol over a
//! [`Transport`]: handshake on connect, correlation-id matching of
//! responses to callers, per-call deadlines and cancellation, and an
//! idempotent disconnect.
//!
//! # State machine
//!
//! ```text
//! new → connecting →(ok)→ connected →(call)→ connected
//!                    │                 └─(transport err)→ degraded ─(close)→ closed
//!                    └─(err)→ closed
//! connected/degraded →(disconnect | transport close)→ closed
//! ```
//!
//! # Correlation
//!
//! Every request gets a fresh id from a per-client counter. A demux task
//! owns the transport's inbound event stream and routes each response to
//! the waiter registered under its id. Responses with no waiter are
//! dropped and (by default) logged. Deadlines and cancellation are
//! enforced at the waiter, never at the transport, so a late reply can
//! only ever find an empty slot, not a caller that already returned.

use crate::transport::{Transport, TransportEvent};
use crate::types::{IncomingFrame, IncomingKind, RequestFrame, WireError};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Connecting,
    Connected,
    Degraded,
    Closed,
}

/// Terminal outcome delivered to one waiter.
#[derive(Debug)]
enum WaitOutcome {
    /// The matching response carried a result
    Result(Value),
    /// The matching response carried a server-reported error
    ServerError(WireError),
    /// The transport closed with the request outstanding
    ConnectionClosed,
    /// The client was disconnected with the request outstanding
    Cancelled,
}

type WaiterMap = Arc<Mutex<HashMap<u64, oneshot::Sender<WaitOutcome>>>>;

/// Per-client behavior knobs.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Log responses whose id matches no registered waiter
    pub log_unmatched_responses: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_unmatched_responses: true,
        }
    }
}

/// One logical connection to a tool server.
pub struct ToolClient {
    server_id: String,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    state_tx: watch::Sender<ClientState>,
    waiters: WaiterMap,
    next_id: AtomicU64,
    demux_task: Mutex<Option<JoinHandle<()>>>,
    settings: ClientSettings,
}

impl ToolClient {
    pub fn new(
        server_id: impl Into<String>,
        transport: Box<dyn Transport>,
        settings: ClientSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ClientState::New);
        Self {
            server_id: server_id.into(),
            transport: tokio::sync::Mutex::new(transport),
            state_tx,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            demux_task: Mutex::new(None),
            settings,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Current session state
    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Subscribe to session state transitions
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the session reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow() == ClientState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of requests still waiting on a response
    pub fn pending_requests(&self) -> usize {
        self.waiters.lock().expect("waiter lock poisoned").len()
    }

    fn set_state(&self, next: ClientState) {
        self.state_tx.send_replace(next);
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<WaitOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(&id);
    }

    /// Complete the protocol handshake.
    ///
    /// Resolves with the session `Connected`, or fails with
    /// `HandshakeFailed`, `TimedOut`, or `Cancelled`; on any failure the
    /// session is torn down to `Closed`.
    pub async fn connect(&self, deadline: Duration, cancel: &CancellationToken) -> Result<()> {
        if self.state() != ClientState::New {
            return Err(Error::config(format!(
                "client for '{}' already used; sessions are single-use",
                self.server_id
            )));
        }
        self.set_state(ClientState::Connecting);

        let events = match self.transport.lock().await.start().await {
            Ok(events) => events,
            Err(err) => {
                self.set_state(ClientState::Closed);
                return Err(match err {
                    Error::HandshakeFailed { .. } => err,
                    other => Error::handshake(&self.server_id, other.to_string()),
                });
            }
        };

        self.spawn_demux(events);

        let (id, rx) = self.register_waiter();
        let frame = RequestFrame::initialize(id).to_value();
        if let Err(err) = self.transport.lock().await.send(frame).await {
            self.remove_waiter(id);
            self.shutdown().await;
            return Err(Error::handshake(&self.server_id, err.to_string()));
        }

        let outcome = tokio::select! {
            outcome = rx => outcome,
            _ = tokio::time::sleep(deadline) => {
                self.remove_waiter(id);
                self.shutdown().await;
                return Err(Error::TimedOut);
            }
            _ = cancel.cancelled() => {
                self.remove_waiter(id);
                self.shutdown().await;
                return Err(Error::Cancelled);
            }
        };

        match outcome {
            Ok(WaitOutcome::Result(_)) => {
                self.set_state(ClientState::Connected);
                log::debug!(target: "tool_broker::client", "[{}] connected", self.server_id);
                Ok(())
            }
            Ok(WaitOutcome::ServerError(err)) => {
                self.shutdown().await;
                Err(Error::handshake(&self.server_id, err.message))
            }
            Ok(WaitOutcome::ConnectionClosed) | Ok(WaitOutcome::Cancelled) | Err(_) => {
                self.shutdown().await;
                Err(Error::handshake(
                    &self.server_id,
                    "connection closed during handshake",
                ))
            }
        }
    }

    /// Invoke a named tool and wait for its matching response.
    ///
    /// Exactly one of result / server error / `TimedOut` / `Cancelled` /
    /// `ConnectionClosed` resolves the call, and the waiter slot is gone
    /// by the time this returns, whichever way it went.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match self.state() {
            ClientState::Connected | ClientState::Degraded => {}
            ClientState::Closed => return Err(Error::connection_closed(&self.server_id)),
            _ => {
                return Err(Error::config(format!(
                    "client for '{}' is not connected",
                    self.server_id
                )));
            }
        }

        let (id, rx) = self.register_waiter();
        let frame = RequestFrame::call_tool(id, name, arguments).to_value();
        if let Err(err) = self.transport.lock().await.send(frame).await {
            self.remove_waiter(id);
            self.set_state(ClientState::Degraded);
            return Err(err);
        }

        let outcome = tokio::select! {
            outcome = rx => outcome,
            _ = tokio::time::sleep(deadline) => {
                self.remove_waiter(id);
                return Err(Error::TimedOut);
            }
            _ = cancel.cancelled() => {
                self.remove_waiter(id);
                return Err(Error::Cancelled);
            }
        };

        match outcome {
            Ok(WaitOutcome::Result(value)) => Ok(value),
            Ok(WaitOutcome::ServerError(err)) => {
                Err(Error::tool_failed(&self.server_id, name, err.message))
            }
            Ok(WaitOutcome::ConnectionClosed) | Err(_) => {
                Err(Error::connection_closed(&self.server_id))
            }
            Ok(WaitOutcome::Cancelled) => Err(Error::Cancelled),
        }
    }

    /// Disconnect the session. Idempotent; all outstanding requests
    /// resolve with `Cancelled`.
    pub async fn disconnect(&self) {
        if self.state() == ClientState::Closed {
            return;
        }
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
            waiters.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(WaitOutcome::Cancelled);
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.set_state(ClientState::Closed);
        self.transport.lock().await.close().await;
        if let Some(task) = self.demux_task.lock().expect("demux lock poisoned").take() {
            task.abort();
        }
    }

    fn spawn_demux(&self, mut events: tokio::sync::mpsc::Receiver<TransportEvent>) {
        let waiters = self.waiters.clone();
        let state_tx = self.state_tx.clone();
        let server_id = self.server_id.clone();
        let log_unmatched = self.settings.log_unmatched_responses;

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Frame(raw) => {
                        let frame = match IncomingFrame::parse(&raw) {
                            Ok(frame) => frame,
                            Err(err) => {
                                log::warn!(
                                    target: "tool_broker::client",
                                    "[{}] unreadable frame: {}",
                                    server_id,
                                    err
                                );
                                continue;
                            }
                        };
                        match frame.classify() {
                            IncomingKind::Response { id, outcome } => {
                                let waiter =
                                    waiters.lock().expect("waiter lock poisoned").remove(&id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(match outcome {
                                            Ok(value) => WaitOutcome::Result(value),
                                            Err(err) => WaitOutcome::ServerError(err),
                                        });
                                    }
                                    None if log_unmatched => {
                                        log::warn!(
                                            target: "tool_broker::client",
                                            "[{}] dropping response with unknown id {}",
                                            server_id,
                                            id
                                        );
                                    }
                                    None => {}
                                }
                            }
                            IncomingKind::Other => {
                                log::debug!(
                                    target: "tool_broker::client",
                                    "[{}] ignoring non-response frame",
                                    server_id
                                );
                            }
                        }
                    }
                    TransportEvent::Error(err) => {
                        log::warn!(
                            target: "tool_broker::client",
                            "[{}] transport error: {}",
                            server_id,
                            err
                        );
                        // A faulted transport degrades the session; close
                        // still comes from the transport itself
                        if *state_tx.borrow() == ClientState::Connected {
                            state_tx.send_replace(ClientState::Degraded);
                        }
                    }
                    TransportEvent::Closed => break,
                }
            }

            // Connection is gone: fail everything still outstanding
            let drained: Vec<_> = {
                let mut map = waiters.lock().expect("waiter lock poisoned");
                map.drain().collect()
            };
            for (_, tx) in drained {
                let _ = tx.send(WaitOutcome::ConnectionClosed);
            }
            state_tx.send_replace(ClientState::Closed);
        });

        *self.demux_task.lock().expect("demux lock poisoned") = Some(task);
    }
}

impl std::fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClient")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-process transport: the test scripts inbound events and observes
    /// outbound frames.
    struct ScriptedTransport {
        inbound: Option<mpsc::Receiver<TransportEvent>>,
        outbound: mpsc::UnboundedSender<Value>,
        fail_start: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
            if self.fail_start {
                return Err(Error::Io(std::io::Error::other("spawn refused")));
            }
            Ok(self.inbound.take().expect("start called once"))
        }

        async fn send(&mut self, frame: Value) -> Result<()> {
            self.outbound
                .send(frame)
                .map_err(|_| Error::connection_closed("scripted"))
        }

        async fn close(&mut self) {}
    }

    struct Harness {
        client: Arc<ToolClient>,
        events: mpsc::Sender<TransportEvent>,
        sent: mpsc::UnboundedReceiver<Value>,
    }

    fn harness() -> Harness {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            inbound: Some(events_rx),
            outbound: out_tx,
            fail_start: false,
        };
        Harness {
            client: Arc::new(ToolClient::new(
                "scripted",
                Box::new(transport),
                ClientSettings::default(),
            )),
            events: events_tx,
            sent: out_rx,
        }
    }

    /// Drive the handshake to completion from the server side.
    async fn complete_handshake(h: &mut Harness) {
        let frame = h.sent.recv().await.expect("handshake frame");
        assert_eq!(frame["payload"]["type"], "initialize");
        let id = frame["id"].as_u64().unwrap();
        h.events
            .send(TransportEvent::Frame(
                json!({"type": "response", "id": id, "result": {"ok": true}}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();

        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;

        connect.await.unwrap().unwrap();
        assert_eq!(h.client.state(), ClientState::Connected);
        assert_eq!(h.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_connect_start_failure_is_handshake_failed() {
        let (_tx, events_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            inbound: Some(events_rx),
            outbound: out_tx,
            fail_start: true,
        };
        let client = ToolClient::new("scripted", Box::new(transport), ClientSettings::default());

        let err = client
            .connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_connect_timeout_leaves_no_waiters() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();

        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_millis(50), &cancel).await },
            );
        // Swallow the handshake frame and never answer
        let _ = h.sent.recv().await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert_eq!(h.client.pending_requests(), 0);
        assert_eq!(h.client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();

        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move {
            client
                .call_tool("echo", json!({"q": "hi"}), Duration::from_secs(1), &cancel)
                .await
        });

        let frame = h.sent.recv().await.expect("call frame");
        assert_eq!(frame["payload"]["type"], "callTool");
        assert_eq!(frame["payload"]["name"], "echo");
        let id = frame["id"].as_u64().unwrap();
        h.events
            .send(TransportEvent::Frame(
                json!({"type": "response", "id": id, "result": {"text": "hi"}}),
            ))
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["text"], "hi");
        assert_eq!(h.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_error_preserved_verbatim() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move {
            client
                .call_tool("echo", json!({}), Duration::from_secs(1), &cancel)
                .await
        });

        let frame = h.sent.recv().await.unwrap();
        let id = frame["id"].as_u64().unwrap();
        h.events
            .send(TransportEvent::Frame(
                json!({"type": "response", "id": id, "error": {"message": "quota exceeded"}}),
            ))
            .await
            .unwrap();

        match call.await.unwrap().unwrap_err() {
            Error::ToolInvocationFailed { message, .. } => {
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected tool invocation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_timeout_removes_waiter_and_late_reply_is_dropped() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move {
            client
                .call_tool("slow", json!({}), Duration::from_millis(50), &cancel)
                .await
        });

        let frame = h.sent.recv().await.unwrap();
        let id = frame["id"].as_u64().unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert_eq!(h.client.pending_requests(), 0);

        // The late reply finds no waiter; it must not wedge the session
        h.events
            .send(TransportEvent::Frame(
                json!({"type": "response", "id": id, "result": {}}),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_transport_close_fails_outstanding_calls() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move {
            client
                .call_tool("echo", json!({}), Duration::from_secs(5), &cancel)
                .await
        });
        let _ = h.sent.recv().await;

        h.events.send(TransportEvent::Closed).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
        assert_eq!(h.client.state(), ClientState::Closed);
        assert_eq!(h.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancel_resolves_call() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let call_cancel = cancel.clone();
        let call = tokio::spawn(async move {
            client
                .call_tool("echo", json!({}), Duration::from_secs(5), &call_cancel)
                .await
        });
        let _ = h.sent.recv().await;

        cancel.cancel();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(h.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        h.client.disconnect().await;
        assert_eq!(h.client.state(), ClientState::Closed);
        h.client.disconnect().await;
        assert_eq!(h.client.state(), ClientState::Closed);

        // Calls after disconnect are rejected cleanly
        let err = h
            .client
            .call_tool(
                "echo",
                json!({}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_transport_error_degrades_session() {
        let mut h = harness();
        let client = h.client.clone();
        let cancel = CancellationToken::new();
        let connect =
            tokio::spawn(
                async move { client.connect(Duration::from_secs(1), &cancel).await },
            );
        complete_handshake(&mut h).await;
        connect.await.unwrap().unwrap();

        h.events
            .send(TransportEvent::Error(Error::frame_parse(
                "scripted", "garbage",
            )))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.state(), ClientState::Degraded);
    }
}
