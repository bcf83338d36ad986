//! Framed transports to tool servers.
//!
//! A [`Transport`] moves opaque JSON frames between this process and one
//! tool server. Two variants exist behind the same capability set:
//!
//! - [`StdioTransport`]: owns a child process. stdin is the write side;
//!   stdout is a line-delimited frame stream (one JSON document per line);
//!   stderr is either piped to the diagnostic sink or inherited.
//! - [`SseTransport`]: opens an HTTP `text/event-stream`. The first
//!   `endpoint` event advertises the companion POST URL; each later
//!   `message` event's data is one inbound frame, and outbound frames are
//!   POSTed to the advertised endpoint.
//!
//! Frames are opaque here: the session layer owns their semantics. A
//! transport never silently drops a frame: anything that fails to parse
//! surfaces as a [`TransportEvent::Error`].

use crate::config::{ServerDescriptor, StderrPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;

/// Capacity of the inbound frame channel per transport.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the shared stderr diagnostic channel. Lagging subscribers
/// lose the oldest lines, never block the child.
pub const STDERR_CHANNEL_CAPACITY: usize = 256;

/// One inbound notification from a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame arrived
    Frame(Value),
    /// Something arrived that was not a well-formed frame, or the
    /// underlying stream failed
    Error(Error),
    /// The connection is gone; no further events follow
    Closed,
}

/// One stderr line captured from a managed child, tagged with its server.
#[derive(Debug, Clone)]
pub struct StderrLine {
    pub server_id: String,
    pub line: String,
}

/// Uniform send/receive over one connection to a tool server.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection and return the inbound event stream.
    ///
    /// Failures here (spawn errors, refused connections, a missing
    /// handshake event) surface as `Err` before any send is permitted.
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Write one frame.
    async fn send(&mut self, frame: Value) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&mut self);
}

// ============================================================================
// STDIO
// ============================================================================

/// Transport over a child process speaking line-delimited JSON on stdio.
pub struct StdioTransport {
    descriptor: Arc<ServerDescriptor>,
    stderr_tx: Option<broadcast::Sender<StderrLine>>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(descriptor: Arc<ServerDescriptor>) -> Self {
        Self {
            descriptor,
            stderr_tx: None,
            child: None,
            stdin: None,
            reader_task: None,
            stderr_task: None,
        }
    }

    /// Route piped stderr lines into the given diagnostic channel.
    ///
    /// Without a sink, piped stderr is still drained (so the child never
    /// blocks on a full pipe) and logged.
    pub fn with_stderr_sink(mut self, tx: broadcast::Sender<StderrLine>) -> Self {
        self.stderr_tx = Some(tx);
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        let desc = &self.descriptor;
        let program = desc
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::config(format!("server '{}' has no command", desc.id)))?;

        let mut command = Command::new(program);
        command
            .args(&desc.args)
            .env_clear()
            .envs(desc.child_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &desc.cwd {
            command.current_dir(cwd);
        }
        match desc.stderr_behavior {
            StderrPolicy::Pipe => {
                command.stderr(Stdio::piped());
            }
            StderrPolicy::Inherit => {
                command.stderr(Stdio::inherit());
            }
        }

        let mut child = command.spawn().map_err(Error::Io)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::config("child stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::config("child stdout was not piped"))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let server_id = desc.id.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let event = match serde_json::from_str::<Value>(&line) {
                            Ok(frame) => TransportEvent::Frame(frame),
                            Err(err) => TransportEvent::Error(Error::frame_parse(
                                &server_id,
                                err.to_string(),
                            )),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(TransportEvent::Error(Error::frame_parse(
                                &server_id,
                                err.to_string(),
                            )))
                            .await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        }));

        if let Some(stderr) = child.stderr.take() {
            let server_id = desc.id.clone();
            let sink = self.stderr_tx.clone();
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!(target: "tool_broker::stderr", "[{}] {}", server_id, line);
                    if let Some(tx) = &sink {
                        // broadcast::send never blocks; lagging receivers
                        // lose the oldest lines
                        let _ = tx.send(StderrLine {
                            server_id: server_id.clone(),
                            line,
                        });
                    }
                }
            }));
        }

        self.stdin = Some(stdin);
        self.child = Some(child);
        Ok(rx)
    }

    async fn send(&mut self, frame: Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::connection_closed(&self.descriptor.id))?;
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(Error::Io)?;
        stdin.flush().await.map_err(Error::Io)?;
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping stdin first lets well-behaved servers exit on EOF
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop covers the child; the tasks end on their own once
        // the pipes close, but abort them to be prompt
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// SSE
// ============================================================================

/// Rewrite a `localhost` hostname to the IPv4 loopback address.
///
/// Local tool servers bind 127.0.0.1 far more reliably than the
/// dual-stack name resolves, so prefer the deterministic form.
pub fn normalize_localhost(mut url: reqwest::Url) -> reqwest::Url {
    if url.host_str() == Some("localhost") {
        // set_host only fails for cannot-be-a-base URLs, which http(s) never are
        let _ = url.set_host(Some("127.0.0.1"));
    }
    url
}

/// Transport over an HTTP Server-Sent Events stream.
pub struct SseTransport {
    server_id: String,
    url: reqwest::Url,
    http: reqwest::Client,
    post_url: Option<reqwest::Url>,
    reader_task: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let raw = descriptor
            .url
            .as_deref()
            .ok_or_else(|| Error::config(format!("server '{}' has no url", descriptor.id)))?;
        let url = reqwest::Url::parse(raw)
            .map_err(|e| Error::config(format!("server '{}' url invalid: {}", descriptor.id, e)))?;
        Ok(Self {
            server_id: descriptor.id.clone(),
            url: normalize_localhost(url),
            http: reqwest::Client::new(),
            post_url: None,
            reader_task: None,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        let response = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(Error::Http)?
            .error_for_status()
            .map_err(Error::Http)?;

        let mut events = response.bytes_stream().eventsource();

        // The server's first event advertises where to POST outbound frames
        let post_url = loop {
            match events.next().await {
                Some(Ok(event)) if event.event == "endpoint" => {
                    let endpoint = event.data.trim();
                    break self.url.join(endpoint).map_err(|e| {
                        Error::handshake(
                            &self.server_id,
                            format!("bad endpoint '{}': {}", endpoint, e),
                        )
                    })?;
                }
                Some(Ok(other)) => {
                    log::debug!(
                        target: "tool_broker::sse",
                        "[{}] ignoring '{}' event before endpoint",
                        self.server_id,
                        other.event
                    );
                }
                Some(Err(err)) => {
                    return Err(Error::handshake(&self.server_id, err.to_string()));
                }
                None => {
                    return Err(Error::handshake(
                        &self.server_id,
                        "stream ended before endpoint event",
                    ));
                }
            }
        };
        self.post_url = Some(post_url);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let server_id = self.server_id.clone();
        self.reader_task = Some(tokio::spawn(async move {
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) if event.event == "message" => {
                        let parsed = match serde_json::from_str::<Value>(&event.data) {
                            Ok(frame) => TransportEvent::Frame(frame),
                            Err(err) => TransportEvent::Error(Error::frame_parse(
                                &server_id,
                                err.to_string(),
                            )),
                        };
                        if tx.send(parsed).await.is_err() {
                            return;
                        }
                    }
                    Ok(other) => {
                        log::debug!(
                            target: "tool_broker::sse",
                            "[{}] ignoring '{}' event",
                            server_id,
                            other.event
                        );
                    }
                    Err(err) => {
                        let _ = tx
                            .send(TransportEvent::Error(Error::frame_parse(
                                &server_id,
                                err.to_string(),
                            )))
                            .await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        }));

        Ok(rx)
    }

    async fn send(&mut self, frame: Value) -> Result<()> {
        let post_url = self
            .post_url
            .clone()
            .ok_or_else(|| Error::connection_closed(&self.server_id))?;
        self.http
            .post(post_url)
            .json(&frame)
            .send()
            .await
            .map_err(Error::Http)?
            .error_for_status()
            .map_err(Error::Http)?;
        Ok(())
    }

    async fn close(&mut self) {
        self.post_url.take();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}
