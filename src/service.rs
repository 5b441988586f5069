//! Service data model
//!
//! A service is a running instance tracked by the registry: a typed record
//! with a lifecycle state, a health verdict, a dependency list, and a
//! kind-specific data payload populated from lifecycle tool responses.
//!
//! State and health names are canonically lowercase on every serialized
//! surface (config, events, control-plane tool output).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running (initial state)
    Stopped,
    /// Start tool call in flight
    Starting,
    /// Start succeeded
    Running,
    /// Stop tool call in flight
    Stopping,
    /// Start/stop/health failure; `last_error` explains why
    Failed,
    /// Waiting out the retry backoff before another start attempt
    Retrying,
}

impl ServiceState {
    /// Whether the FSM permits moving from `self` to `next`.
    ///
    /// This is the full transition table; nothing outside it ever happens.
    /// The "any state to stopped" unregister path is handled separately by
    /// [`ServiceState::forced_stop_allowed`].
    #[must_use]
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::{Failed, Retrying, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Failed, Starting)
                | (Failed, Retrying)
                | (Retrying, Starting)
        )
    }

    /// Unregister forces any state to stopped after a best-effort stop.
    #[must_use]
    pub fn forced_stop_allowed(self) -> bool {
        true
    }

    /// Whether a start may begin from this state
    #[must_use]
    pub fn startable(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Retrying)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Health verdict of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No health information yet
    Unknown,
    /// Last check(s) succeeded
    Healthy,
    /// Partially working
    Degraded,
    /// Failure threshold reached
    Unhealthy,
    /// A check is currently in flight
    Checking,
}

impl HealthState {
    /// Parse a health value extracted from a tool response
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "healthy" | "ok" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            "checking" => Some(Self::Checking),
            _ => None,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Checking => "checking",
        };
        f.write_str(s)
    }
}

/// Kind of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ServiceKind {
    /// Kubernetes API connection
    KubeConnection,
    /// Managed MCP server process (becomes an aggregator upstream)
    McpServer,
    /// kubectl-style port-forward tunnel
    PortForward,
    /// The aggregator endpoint itself
    Aggregator,
    /// A user-defined class type
    Custom(String),
}

impl ServiceKind {
    /// Canonical kind name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::KubeConnection => "kube-connection",
            Self::McpServer => "mcp-server",
            Self::PortForward => "port-forward",
            Self::Aggregator => "aggregator",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ServiceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "kube-connection" => Self::KubeConnection,
            "mcp-server" => Self::McpServer,
            "port-forward" => Self::PortForward,
            "aggregator" => Self::Aggregator,
            _ => Self::Custom(s),
        }
    }
}

impl From<ServiceKind> for String {
    fn from(kind: ServiceKind) -> Self {
        kind.as_str().to_string()
    }
}

/// MCP server runtime data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerData {
    /// SSE endpoint base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Listening port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Process id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Kubernetes connection runtime data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeConnectionData {
    /// kubeconfig context name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Ready node count from the last status probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_nodes: Option<u32>,
}

/// Port-forward runtime data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortForwardData {
    /// Local listening port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Remote target port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Forward target (pod/service reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Aggregator runtime data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorData {
    /// Public endpoint URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Tools currently in the catalog
    pub tool_count: usize,
    /// Connected upstream servers
    pub server_count: usize,
}

/// A summarizable, JSON-renderable view over kind-specific service data
pub trait DataView {
    /// One-line human summary for status output
    fn summarize(&self) -> String;
    /// Full JSON rendering
    fn as_json(&self) -> Value;
}

impl DataView for McpServerData {
    fn summarize(&self) -> String {
        match (&self.endpoint, self.pid) {
            (Some(ep), Some(pid)) => format!("{ep} (pid {pid})"),
            (Some(ep), None) => ep.clone(),
            (None, Some(pid)) => format!("pid {pid}"),
            (None, None) => "not started".to_string(),
        }
    }

    fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl DataView for KubeConnectionData {
    fn summarize(&self) -> String {
        let ctx = self.context.as_deref().unwrap_or("?");
        match self.ready_nodes {
            Some(n) => format!("{ctx} ({n} nodes ready)"),
            None => ctx.to_string(),
        }
    }

    fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl DataView for PortForwardData {
    fn summarize(&self) -> String {
        match (self.local_port, self.remote_port) {
            (Some(l), Some(r)) => format!("localhost:{l} -> {}:{r}", self.target.as_deref().unwrap_or("?")),
            _ => "not established".to_string(),
        }
    }

    fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl DataView for AggregatorData {
    fn summarize(&self) -> String {
        format!(
            "{} ({} tools from {} servers)",
            self.endpoint.as_deref().unwrap_or("?"),
            self.tool_count,
            self.server_count
        )
    }

    fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Kind-specific runtime data payload
///
/// Tool responses are destructured into typed fields per kind; user-defined
/// classes get a free-form map. Unknown fields on a built-in kind are a
/// validation error, caught at class load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceData {
    /// MCP server payload
    McpServer(McpServerData),
    /// Kubernetes connection payload
    KubeConnection(KubeConnectionData),
    /// Port-forward payload
    PortForward(PortForwardData),
    /// Aggregator payload
    Aggregator(AggregatorData),
    /// Free-form payload for user-defined classes
    Custom(Map<String, Value>),
}

impl ServiceData {
    /// Empty payload for a kind
    #[must_use]
    pub fn for_kind(kind: &ServiceKind) -> Self {
        match kind {
            ServiceKind::McpServer => Self::McpServer(McpServerData::default()),
            ServiceKind::KubeConnection => Self::KubeConnection(KubeConnectionData::default()),
            ServiceKind::PortForward => Self::PortForward(PortForwardData::default()),
            ServiceKind::Aggregator => Self::Aggregator(AggregatorData::default()),
            ServiceKind::Custom(_) => Self::Custom(Map::new()),
        }
    }

    /// Field names a kind accepts from response mappings, or `None` when
    /// any field is accepted.
    #[must_use]
    pub fn known_fields(kind: &ServiceKind) -> Option<&'static [&'static str]> {
        match kind {
            ServiceKind::McpServer => Some(&["endpoint", "port", "pid"]),
            ServiceKind::KubeConnection => Some(&["context", "readyNodes"]),
            ServiceKind::PortForward => Some(&["localPort", "remotePort", "target"]),
            ServiceKind::Aggregator => Some(&["endpoint", "toolCount", "serverCount"]),
            ServiceKind::Custom(_) => None,
        }
    }

    /// Apply one extracted response field
    pub fn apply_field(&mut self, key: &str, value: Value) -> Result<()> {
        fn as_port(value: &Value) -> Option<u16> {
            value.as_u64().and_then(|n| u16::try_from(n).ok())
        }
        fn as_u32(value: &Value) -> Option<u32> {
            value.as_u64().and_then(|n| u32::try_from(n).ok())
        }
        fn as_string(value: &Value) -> Option<String> {
            match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        }
        let reject = |key: &str| {
            Err(Error::validation(
                key,
                "response mapping target not accepted by this service kind",
            ))
        };

        match self {
            Self::McpServer(data) => match key {
                "endpoint" => data.endpoint = as_string(&value),
                "port" => data.port = as_port(&value),
                "pid" => data.pid = as_u32(&value),
                _ => return reject(key),
            },
            Self::KubeConnection(data) => match key {
                "context" => data.context = as_string(&value),
                "readyNodes" => data.ready_nodes = as_u32(&value),
                _ => return reject(key),
            },
            Self::PortForward(data) => match key {
                "localPort" => data.local_port = as_port(&value),
                "remotePort" => data.remote_port = as_port(&value),
                "target" => data.target = as_string(&value),
                _ => return reject(key),
            },
            Self::Aggregator(data) => match key {
                "endpoint" => data.endpoint = as_string(&value),
                "toolCount" => data.tool_count = value.as_u64().unwrap_or(0) as usize,
                "serverCount" => data.server_count = value.as_u64().unwrap_or(0) as usize,
                _ => return reject(key),
            },
            Self::Custom(map) => {
                map.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// One-line summary of the payload
    #[must_use]
    pub fn summarize(&self) -> String {
        match self {
            Self::McpServer(d) => d.summarize(),
            Self::KubeConnection(d) => d.summarize(),
            Self::PortForward(d) => d.summarize(),
            Self::Aggregator(d) => d.summarize(),
            Self::Custom(map) => {
                if map.is_empty() {
                    "no data".to_string()
                } else {
                    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    keys.sort_unstable();
                    keys.join(", ")
                }
            }
        }
    }

    /// JSON rendering of the payload
    #[must_use]
    pub fn as_json(&self) -> Value {
        match self {
            Self::McpServer(d) => d.as_json(),
            Self::KubeConnection(d) => d.as_json(),
            Self::PortForward(d) => d.as_json(),
            Self::Aggregator(d) => d.as_json(),
            Self::Custom(map) => Value::Object(map.clone()),
        }
    }
}

/// The registry's record of one service instance
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    /// Globally unique label
    pub label: String,
    /// Service kind
    pub kind: ServiceKind,
    /// Lifecycle state
    pub state: ServiceState,
    /// Health verdict
    pub health: HealthState,
    /// Failure description; non-empty exactly when state is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Labels this service depends on (start-before ordering)
    pub dependencies: Vec<String>,
    /// Kind-specific runtime data
    pub data: ServiceData,
    /// ServiceClass that produced this instance, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_ref: Option<String>,
    /// Frozen creation parameters
    pub creation_parameters: Map<String, Value>,
    /// Identifier reported by the managing tool, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Start attempts consumed by the current retry cycle
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_attempts: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Last health check timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ServiceRecord {
    /// New record in the initial stopped state
    #[must_use]
    pub fn new(label: impl Into<String>, kind: ServiceKind) -> Self {
        let now = Utc::now();
        let data = ServiceData::for_kind(&kind);
        Self {
            label: label.into(),
            kind,
            state: ServiceState::Stopped,
            health: HealthState::Unknown,
            last_error: None,
            dependencies: Vec::new(),
            data,
            class_ref: None,
            creation_parameters: Map::new(),
            service_id: None,
            retry_attempts: 0,
            created_at: now,
            updated_at: now,
            last_checked: None,
        }
    }

    /// Builder-style dependency list
    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Builder-style class reference
    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class_ref = Some(class.into());
        self
    }

    /// Builder-style creation parameters
    #[must_use]
    pub fn with_parameters(mut self, params: Map<String, Value>) -> Self {
        self.creation_parameters = params;
        self
    }

    /// Status summary for control-plane output
    #[must_use]
    pub fn status_json(&self) -> Value {
        serde_json::json!({
            "label": self.label,
            "type": self.kind.as_str(),
            "state": self.state.to_string(),
            "health": self.health.to_string(),
            "error": self.last_error,
            "dependencies": self.dependencies,
            "class": self.class_ref,
            "summary": self.data.summarize(),
            "data": self.data.as_json(),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}
