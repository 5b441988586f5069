//! Per-upstream client worker
//!
//! Every running MCP-server service gets one worker task owning the SSE
//! connection. Requests flow through a serialized channel, which keeps
//! JSON-RPC id allocation in order per upstream. On transport loss the
//! worker reconnects with exponential backoff and re-fetches the upstream's
//! catalog slice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::backoff::ReconnectBackoff;
use crate::aggregator::catalog::UpstreamCatalog;
use crate::protocol::{
    JsonRpcResponse, PromptsListResult, ResourcesListResult, ToolsListResult,
};
use crate::transport::SseConnection;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker-to-aggregator notifications
#[derive(Debug)]
pub enum UpstreamEvent {
    /// Handshake finished and the catalog slice was fetched
    Connected {
        /// Upstream label
        label: String,
        /// Freshly fetched slice
        catalog: UpstreamCatalog,
    },
    /// The transport dropped; the worker is backing off to reconnect
    Disconnected {
        /// Upstream label
        label: String,
    },
}

struct UpstreamRequest {
    method: String,
    params: Option<Value>,
    timeout: Duration,
    reply: oneshot::Sender<Result<JsonRpcResponse>>,
}

/// Handle to one upstream's worker task
pub struct UpstreamHandle {
    /// Upstream label (service label of the MCP server)
    pub label: String,
    /// Namespace prefix applied to this upstream's catalog items
    pub prefix: String,
    /// Connection sequence number (first-wins collision ordering)
    pub seq: u64,
    /// Endpoint base URL
    pub endpoint: String,
    tx: mpsc::Sender<UpstreamRequest>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl UpstreamHandle {
    /// Spawn a worker for an upstream endpoint
    #[must_use]
    pub fn spawn(
        label: String,
        endpoint: String,
        prefix: String,
        seq: u64,
        backoff: ReconnectBackoff,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(32);
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(worker(
            label.clone(),
            endpoint.clone(),
            rx,
            events,
            backoff,
            Arc::clone(&connected),
            cancel.clone(),
        ));

        Arc::new(Self {
            label,
            prefix,
            seq,
            endpoint,
            tx,
            connected,
            cancel,
        })
    }

    /// Whether the worker currently holds a live connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Forward a JSON-RPC request to the upstream
    ///
    /// # Errors
    ///
    /// `UpstreamUnavailable` when disconnected; `Timeout` when the call
    /// exceeds `timeout`; `Transport` when the connection drops mid-call.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(Error::UpstreamUnavailable(self.label.clone()));
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UpstreamRequest {
                method: method.to_string(),
                params,
                timeout,
                reply,
            })
            .await
            .map_err(|_| Error::UpstreamUnavailable(self.label.clone()))?;

        rx.await
            .map_err(|_| Error::UpstreamUnavailable(self.label.clone()))?
    }

    /// Stop the worker and close the connection
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn worker(
    label: String,
    endpoint: String,
    mut rx: mpsc::Receiver<UpstreamRequest>,
    events: mpsc::Sender<UpstreamEvent>,
    mut backoff: ReconnectBackoff,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let conn = match establish(&label, &endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    upstream = %label,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Upstream connect failed, backing off"
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let catalog = match fetch_catalog(&conn).await {
            Ok(catalog) => catalog,
            Err(e) => {
                conn.close();
                let delay = backoff.next_delay();
                warn!(
                    upstream = %label,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Upstream catalog fetch failed, backing off"
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        backoff.reset();
        connected.store(true, Ordering::Release);
        info!(
            upstream = %label,
            tools = catalog.tools.len(),
            "Upstream connected"
        );
        if events
            .send(UpstreamEvent::Connected {
                label: label.clone(),
                catalog,
            })
            .await
            .is_err()
        {
            conn.close();
            break;
        }

        serve(&conn, &mut rx, &cancel).await;

        connected.store(false, Ordering::Release);
        conn.close();

        if cancel.is_cancelled() {
            break;
        }
        debug!(upstream = %label, "Upstream disconnected");
        if events
            .send(UpstreamEvent::Disconnected {
                label: label.clone(),
            })
            .await
            .is_err()
        {
            break;
        }
    }

    connected.store(false, Ordering::Release);
}

async fn establish(label: &str, endpoint: &str) -> Result<SseConnection> {
    let conn = SseConnection::connect(endpoint, CONNECT_TIMEOUT).await?;
    let init = conn.initialize(HANDSHAKE_TIMEOUT).await?;
    debug!(
        upstream = %label,
        server = %init.server_info.name,
        protocol = %init.protocol_version,
        "Upstream handshake complete"
    );
    Ok(conn)
}

/// Serve requests until the transport drops or the worker is cancelled
async fn serve(
    conn: &SseConnection,
    rx: &mut mpsc::Receiver<UpstreamRequest>,
    cancel: &CancellationToken,
) {
    let closed = conn.closed_token();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = closed.cancelled() => break,
            request = rx.recv() => {
                let Some(request) = request else { break };
                let response = conn
                    .request(&request.method, request.params, request.timeout)
                    .await;
                let _ = request.reply.send(response);
            }
        }
    }
}

async fn fetch_catalog(conn: &SseConnection) -> Result<UpstreamCatalog> {
    let mut catalog = UpstreamCatalog::default();

    let tools = conn
        .request("tools/list", None, HANDSHAKE_TIMEOUT)
        .await?;
    if let Some(result) = tools.result {
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        catalog.tools = parsed.tools;
    }

    // Resources and prompts are optional server capabilities; treat a
    // method-not-found as an empty slice.
    if let Ok(resources) = conn.request("resources/list", None, HANDSHAKE_TIMEOUT).await {
        if let Some(result) = resources.result {
            if let Ok(parsed) = serde_json::from_value::<ResourcesListResult>(result) {
                catalog.resources = parsed.resources;
            }
        }
    }
    if let Ok(prompts) = conn.request("prompts/list", None, HANDSHAKE_TIMEOUT).await {
        if let Some(result) = prompts.result {
            if let Ok(parsed) = serde_json::from_value::<PromptsListResult>(result) {
                catalog.prompts = parsed.prompts;
            }
        }
    }

    Ok(catalog)
}
