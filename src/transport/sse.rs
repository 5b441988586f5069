//! HTTP+SSE client transport
//!
//! One connection per upstream: a persistent `GET /sse` stream read by a
//! background task, and JSON-RPC requests POSTed to the message endpoint
//! announced by the server's first `endpoint` event. Responses arrive on
//! the stream and are correlated to callers by request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, header};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::MCP_PROTOCOL_VERSION;
use crate::protocol::{
    InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};
use crate::{Error, Result};

/// A parsed server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (defaults to "message")
    pub event: String,
    /// Joined data lines
    pub data: String,
    /// Last event id, if the server sent one
    pub id: Option<String>,
}

/// Incremental SSE frame parser
///
/// Feed raw bytes as they arrive; complete events come out. Handles
/// partial lines across chunk boundaries, CRLF, comments, and multi-line
/// data per the SSE wire format.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: String,
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning any events completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.line_buf.push_str(&String::from_utf8_lossy(chunk));

        while let Some(newline) = self.line_buf.find('\n') {
            let mut line: String = self.line_buf.drain(..=newline).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            self.process_line(&line, &mut out);
        }
        out
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // Blank line dispatches the pending event.
            if !self.data.is_empty() || self.event_type.is_some() {
                out.push(SseEvent {
                    event: self
                        .event_type
                        .take()
                        .unwrap_or_else(|| "message".to_string()),
                    data: self.data.join("\n"),
                    id: self.id.clone(),
                });
                self.data.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return; // comment / keep-alive
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => trace!(field, "Ignoring unknown SSE field"),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// A live client connection to one upstream MCP server
pub struct SseConnection {
    http: Client,
    message_url: Url,
    pending: PendingMap,
    notifications: Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    next_id: AtomicI64,
    closed: CancellationToken,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseConnection {
    /// Open the SSE stream and wait for the server's `endpoint` event
    ///
    /// # Errors
    ///
    /// `Transport` when the stream cannot be established or the endpoint
    /// event does not arrive within `connect_timeout`.
    pub async fn connect(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| Error::Transport(format!("bad URL: {e}")))?;
        let sse_url = base
            .join("sse")
            .map_err(|e| Error::Transport(format!("bad URL: {e}")))?;

        // No whole-request timeout: the SSE stream is expected to live
        // forever. POSTs set their own timeouts per request.
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response = http
            .get(sse_url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("SSE connect failed: {status}")));
        }

        let mut stream = response.bytes_stream().boxed();
        let mut parser = SseParser::new();
        let mut early = Vec::new();

        let endpoint = tokio::time::timeout(connect_timeout, async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::Transport(e.to_string()))?;
                for event in parser.feed(&chunk) {
                    if event.event == "endpoint" {
                        return Ok(event.data);
                    }
                    early.push(event);
                }
            }
            Err(Error::Transport(
                "SSE stream closed before endpoint event".to_string(),
            ))
        })
        .await
        .map_err(|_| Error::Timeout("waiting for SSE endpoint event".to_string()))??;

        let message_url = base
            .join(&endpoint)
            .map_err(|e| Error::Transport(format!("bad endpoint URI '{endpoint}': {e}")))?;
        debug!(url = %message_url, "SSE transport connected");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            stream,
            parser,
            early,
            Arc::clone(&pending),
            notify_tx,
            closed.clone(),
        ));

        Ok(Self {
            http,
            message_url,
            pending,
            notifications: Mutex::new(Some(notify_rx)),
            next_id: AtomicI64::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Perform the MCP `initialize` handshake
    ///
    /// # Errors
    ///
    /// `Protocol` when the server rejects initialization.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "envctl",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self.request("initialize", Some(params), timeout).await?;
        if let Some(err) = response.error {
            return Err(Error::Protocol(format!(
                "initialize failed: {} ({})",
                err.message, err.code
            )));
        }
        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| Error::Protocol("initialize returned no result".to_string()))?,
        )?;

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Send a request and await its response from the stream
    ///
    /// # Errors
    ///
    /// `Transport` when the connection is gone, `Timeout` when no response
    /// arrives in time.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        let post = self
            .http
            .post(self.message_url.clone())
            .json(&request)
            .timeout(timeout)
            .send()
            .await;

        match post {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.pending.lock().remove(&id);
                return Err(Error::Transport(format!(
                    "message POST failed: {}",
                    resp.status()
                )));
            }
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(Error::Transport(e.to_string()));
            }
        }

        tokio::select! {
            response = rx => response
                .map_err(|_| Error::Transport("connection closed awaiting response".to_string())),
            () = tokio::time::sleep(timeout) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!("{method} exceeded {timeout:?}")))
            }
        }
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let resp = self
            .http
            .post(self.message_url.clone())
            .json(&notification)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "notification POST failed: {}",
                resp.status()
            )))
        }
    }

    /// Take the notification receiver (first caller wins)
    #[must_use]
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.notifications.lock().take()
    }

    /// Whether the stream is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Token cancelled when the stream ends
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Close the connection
    pub fn close(&self) {
        self.closed.cancel();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    mut parser: SseParser,
    early: Vec<SseEvent>,
    pending: PendingMap,
    notify_tx: mpsc::Sender<JsonRpcNotification>,
    closed: CancellationToken,
) {
    for event in early {
        handle_event(&event, &pending, &notify_tx);
    }

    loop {
        let chunk = tokio::select! {
            () = closed.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&bytes) {
                    handle_event(&event, &pending, &notify_tx);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "SSE stream error");
                break;
            }
            None => break,
        }
    }

    closed.cancel();
    // Dropping pending senders wakes every waiter with a transport error.
    pending.lock().clear();
}

fn handle_event(event: &SseEvent, pending: &PendingMap, notify_tx: &mpsc::Sender<JsonRpcNotification>) {
    if event.event != "message" {
        trace!(event = %event.event, "Ignoring non-message SSE event");
        return;
    }
    match serde_json::from_str::<JsonRpcMessage>(&event.data) {
        Ok(JsonRpcMessage::Response(response)) => {
            let id = match &response.id {
                Some(RequestId::Number(n)) => Some(*n),
                Some(RequestId::String(s)) => s.parse().ok(),
                None => None,
            };
            if let Some(id) = id {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(response);
                } else {
                    trace!(id, "Response for unknown request id");
                }
            }
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            let _ = notify_tx.try_send(notification);
        }
        Ok(JsonRpcMessage::Request(request)) => {
            trace!(method = %request.method, "Ignoring server-to-client request");
        }
        Err(e) => warn!(error = %e, "Unparseable SSE message event"),
    }
}
