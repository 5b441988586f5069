//! Shared test support: a recording tool invoker and a mock upstream MCP
//! server speaking the HTTP+SSE pairing.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use envctl::aggregator::ToolInvoker;
use envctl::class::{ServiceClassDef, ServiceClassManager};
use envctl::error::{Error, Result};
use envctl::registry::Registry;
use envctl::service::{ServiceKind, ServiceRecord, ServiceState};

// ============================================================================
// Recording invoker
// ============================================================================

/// Tool invoker that records calls and can be told to fail specific tools.
pub struct RecordingInvoker {
    pub calls: Mutex<Vec<(String, Value)>>,
    pub fail: Mutex<BTreeSet<String>>,
    pub response: Mutex<Value>,
}

impl RecordingInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(BTreeSet::new()),
            response: Mutex::new(json!({})),
        })
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl ToolInvoker for RecordingInvoker {
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.calls.lock().push((name.to_string(), args));
        if self.fail.lock().contains(name) {
            return Err(Error::Internal(format!("{name} failed")));
        }
        Ok(self.response.lock().clone())
    }

    fn has_tool(&self, _name: &str) -> bool {
        true
    }
}

/// A minimal class whose lifecycle tools are `<name>_start` / `<name>_stop`.
pub fn simple_class(name: &str) -> ServiceClassDef {
    serde_yaml::from_str(&format!(
        r"
name: {name}
version: '1.0'
description: integration test class
serviceConfig:
  lifecycleTools:
    start:
      tool: {name}_start
    stop:
      tool: {name}_stop
"
    ))
    .unwrap()
}

/// Register a chain of classed services: each label also names its class.
pub fn register_chain(
    registry: &Registry,
    classes: &ServiceClassManager,
    chain: &[(&str, &[&str])],
) {
    for (label, deps) in chain {
        classes.create(simple_class(label)).unwrap();
        registry
            .register(
                ServiceRecord::new(*label, ServiceKind::Custom((*label).to_string()))
                    .with_class(*label)
                    .with_dependencies(deps.iter().map(ToString::to_string).collect()),
            )
            .unwrap();
    }
}

/// Poll until a service reaches a state or the budget runs out.
pub async fn wait_for_state(
    registry: &Registry,
    label: &str,
    state: ServiceState,
    budget: std::time::Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if registry.get_record(label).is_some_and(|r| r.state == state) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

/// Poll an arbitrary condition.
pub async fn wait_until<F: Fn() -> bool>(budget: std::time::Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Mock upstream MCP server
// ============================================================================

struct UpstreamState {
    tools: Vec<String>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    sessions: DashMap<String, mpsc::Sender<String>>,
}

/// An in-process MCP server with a fixed tool list, served over the
/// `GET /sse` + `POST /message` pairing.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
    server: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Bind an ephemeral port.
    pub async fn start(tools: &[&str]) -> Self {
        Self::start_on(0, tools).await
    }

    /// Bind a specific port (0 for ephemeral).
    pub async fn start_on(port: u16, tools: &[&str]) -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(UpstreamState {
            tools: tools.iter().map(ToString::to_string).collect(),
            calls: Arc::clone(&calls),
            sessions: DashMap::new(),
        });

        let app = Router::new()
            .route("/sse", get(upstream_sse))
            .route("/message", post(upstream_message))
            .with_state(state);

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            calls,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Kill the server, dropping every SSE stream.
    pub fn shutdown(&self) {
        self.server.abort();
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upstream_sse(
    State(state): State<Arc<UpstreamState>>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<String>(32);
    state.sessions.insert(id.clone(), tx);

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/message?sessionId={id}")));
        while let Some(data) = rx.recv().await {
            yield Ok(Event::default().event("message").data(data));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(5)))
}

#[derive(serde::Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn upstream_message(
    State(state): State<Arc<UpstreamState>>,
    Query(query): Query<SessionQuery>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    // Notifications carry no id and get no response.
    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    let method = body["method"].as_str().unwrap_or_default().to_string();

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock-upstream", "version": "0.0.1"},
        }),
        "tools/list" => {
            let tools: Vec<Value> = state
                .tools
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{name} (mock)"),
                        "inputSchema": {"type": "object"},
                    })
                })
                .collect();
            json!({"tools": tools})
        }
        "tools/call" => {
            let name = body["params"]["name"].as_str().unwrap_or_default().to_string();
            let args = body["params"]["arguments"].clone();
            state.calls.lock().push((name.clone(), args.clone()));
            json!({
                "content": [{"type": "text", "text": format!("{name} ok")}],
                "isError": false,
                "echo": args,
            })
        }
        "resources/list" => json!({"resources": []}),
        "prompts/list" => json!({"prompts": []}),
        _ => json!({}),
    };

    let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
    if let Some(tx) = state.sessions.get(&query.session_id) {
        let _ = tx.try_send(response.to_string());
    }
    StatusCode::ACCEPTED
}
