//! Aggregated MCP endpoint
//!
//! axum server speaking the 2024-11-05 HTTP+SSE pairing downstream:
//! `GET /sse` opens a session and streams an `endpoint` event followed by
//! JSON-RPC responses; `POST /message?sessionId=…` accepts requests and
//! returns 202 while the response rides the session's stream. `/health`
//! reports liveness.

mod control;
mod handler;
mod session;

pub use handler::McpHandler;
pub use session::SessionMap;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, ToolInvoker, ToolPolicy};
use crate::class::{ClassEvent, ServiceClassManager};
use crate::config::{Config, ConfigStore, ServiceSpec};
use crate::error::rpc_codes;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleRunner;
use crate::orchestrator::Orchestrator;
use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
use crate::registry::Registry;
use crate::scheduler::DependencyScheduler;
use crate::service::{AggregatorData, ServiceData, ServiceKind, ServiceRecord};
use crate::{Error, Result};

/// Label under which the aggregator registers itself
pub const AGGREGATOR_LABEL: &str = "mcp-aggregator";

/// Shared router state
pub struct AppState {
    /// JSON-RPC handler
    pub handler: Arc<McpHandler>,
    /// Connected downstream sessions
    pub sessions: Arc<SessionMap>,
}

/// The assembled control plane
///
/// Owns every component and the wiring between them. Construction is pure
/// dependency injection; nothing global.
pub struct ControlPlane {
    config: Config,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    classes: Arc<ServiceClassManager>,
    aggregator: Arc<Aggregator>,
    orchestrator: Arc<Orchestrator>,
    handler: Arc<McpHandler>,
    sessions: Arc<SessionMap>,
}

impl ControlPlane {
    /// Build the component graph from configuration
    pub fn build(config: Config, config_path: Option<PathBuf>) -> Self {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(EventBus::new());
        let classes = Arc::new(ServiceClassManager::new());
        let policy = Arc::new(ToolPolicy::new(config.aggregator.yolo));

        let aggregator = Aggregator::new(
            Arc::clone(&registry),
            Arc::clone(&classes),
            policy,
            config.aggregator.settings(),
        );
        let runner = LifecycleRunner::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&classes),
            Arc::clone(&aggregator) as Arc<dyn ToolInvoker>,
        );
        let scheduler = DependencyScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&runner),
            config.orchestrator.parallelism,
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&classes),
            Arc::clone(&runner),
            Arc::clone(&scheduler),
        );
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&classes),
            Arc::clone(&runner),
            Arc::clone(&scheduler),
        );

        // Background wiring: upstream connect/disconnect, health loops,
        // class availability tracking.
        let _aggregator_task = aggregator.attach_bus(&bus);
        let _health_task = monitor.attach_bus(&bus);
        let _availability_task = classes.watch_catalog(aggregator.subscribe_catalog());

        for dir in &config.class_dirs {
            let report = classes.load_dir(Path::new(dir));
            for (path, error) in &report.errors {
                warn!(path = %path.display(), error, "ServiceClass skipped");
            }
        }

        let store = Arc::new(ConfigStore::new(config.clone(), config_path));
        let handler = McpHandler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&aggregator),
            Arc::clone(&classes),
            store,
        );

        Self {
            config,
            registry,
            bus,
            classes,
            aggregator,
            orchestrator,
            handler,
            sessions: Arc::new(SessionMap::new()),
        }
    }

    /// The orchestrator (public surface for CLI/TUI embedding)
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// The aggregator
    #[must_use]
    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    /// The event bus
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Build the axum router
    #[must_use]
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            handler: Arc::clone(&self.handler),
            sessions: Arc::clone(&self.sessions),
        });
        create_router(state)
    }

    /// Bind, register the aggregator as a service, create declarative
    /// instances, and serve until ctrl-c
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "Aggregator endpoint listening");

        self.register_self(local).await;
        self.apply_service_specs();

        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Shutting down, stopping services");
        self.orchestrator.shutdown().await;
        Ok(())
    }

    /// The aggregator is itself a registered, classless service
    async fn register_self(&self, addr: SocketAddr) {
        let snapshot = self.aggregator.catalog();
        let mut record = ServiceRecord::new(AGGREGATOR_LABEL, ServiceKind::Aggregator);
        record.data = ServiceData::Aggregator(AggregatorData {
            endpoint: Some(format!("http://{addr}/sse")),
            tool_count: snapshot.tool_count(),
            server_count: 0,
        });
        if let Err(e) = self.registry.register(record) {
            warn!(error = %e, "Aggregator self-registration failed");
            return;
        }
        if let Err(e) = self
            .orchestrator
            .start_service(AGGREGATOR_LABEL, &CancellationToken::new())
            .await
        {
            warn!(error = %e, "Aggregator self-start failed");
        }
    }

    /// Create (and optionally start) configured service instances.
    /// Instances whose class is not yet available are created as soon as it
    /// becomes available.
    fn apply_service_specs(&self) {
        for spec in self.config.services.clone() {
            self.apply_spec(spec);
        }
    }

    fn apply_spec(&self, spec: ServiceSpec) {
        match self
            .orchestrator
            .create_service(&spec.class, spec.label.clone(), spec.params.clone())
        {
            Ok(record) => {
                info!(service = %record.label, class = %spec.class, "Configured service created");
                if spec.auto_start {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let label = record.label;
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator
                            .start_service(&label, &CancellationToken::new())
                            .await
                        {
                            warn!(service = %label, error = %e, "Autostart failed");
                        }
                    });
                }
            }
            Err(Error::ClassUnavailable { class, .. }) => {
                debug!(class = %class, "Class not yet available, deferring creation");
                self.defer_spec(spec);
            }
            Err(e) => {
                warn!(class = %spec.class, error = %e, "Configured service rejected");
            }
        }
    }

    fn defer_spec(&self, spec: ServiceSpec) {
        let mut events = self.classes.subscribe();
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let ClassEvent::AvailabilityChanged { name, available: true } = event else {
                    continue;
                };
                if name != spec.class {
                    continue;
                }
                match orchestrator.create_service(&spec.class, spec.label.clone(), spec.params.clone())
                {
                    Ok(record) => {
                        info!(service = %record.label, class = %spec.class, "Deferred service created");
                        if spec.auto_start {
                            if let Err(e) = orchestrator
                                .start_service(&record.label, &CancellationToken::new())
                                .await
                            {
                                warn!(service = %record.label, error = %e, "Autostart failed");
                            }
                        }
                    }
                    Err(Error::AlreadyRegistered(_)) => {}
                    Err(e) => {
                        warn!(class = %spec.class, error = %e, "Deferred creation failed");
                    }
                }
                break;
            }
        });
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

struct SessionGuard {
    sessions: Arc<SessionMap>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

/// GET /sse - open a session and stream server-push events
async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (id, mut rx) = state.sessions.create();
    info!(session = %id, "SSE client connected");

    let sessions = Arc::clone(&state.sessions);
    let stream = async_stream::stream! {
        let _guard = SessionGuard { sessions, id: id.clone() };
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/message?sessionId={id}")));
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(data) => yield Ok(Event::default().event("message").data(data)),
                Err(e) => warn!(error = %e, "Unserializable outbound message"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// POST /message - accept a JSON-RPC message for a session
async fn message_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> impl IntoResponse {
    if !state.sessions.contains(&query.session_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        );
    }

    match serde_json::from_str::<JsonRpcMessage>(&body) {
        Ok(JsonRpcMessage::Request(request)) => {
            let handler = Arc::clone(&state.handler);
            let sessions = Arc::clone(&state.sessions);
            let session_id = query.session_id;
            // The response rides the SSE stream; the POST only acknowledges.
            tokio::spawn(async move {
                let response = handler.handle(request).await;
                if !sessions.push(&session_id, JsonRpcMessage::Response(response)) {
                    debug!(session = %session_id, "Session gone before response delivery");
                }
            });
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            debug!(method = %notification.method, "Client notification");
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
        }
        Ok(JsonRpcMessage::Response(_)) => {
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
        }
        Err(e) => {
            let error = JsonRpcResponse::error(
                None,
                rpc_codes::PARSE_ERROR,
                format!("Parse error: {e}"),
            );
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(error).unwrap_or(json!({"error": "parse error"}))),
            )
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
