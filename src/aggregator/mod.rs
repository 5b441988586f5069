//! MCP Aggregator
//!
//! Multiplexes every running MCP-server service into a single endpoint.
//! Watches the event bus: a server entering `running` gets a client worker
//! connected to its SSE endpoint; `stopping`/`failed` tears the worker
//! down. Each connect rebuilds that upstream's slice of the merged catalog
//! and publishes a catalog-changed signal that drives ServiceClass
//! availability.

mod backoff;
mod catalog;
mod policy;
mod upstream;

pub use backoff::ReconnectBackoff;
pub use catalog::{CatalogSnapshot, PromptCatalogEntry, ToolCatalogEntry, UpstreamCatalog};
pub use policy::{DESTRUCTIVE_KEYWORDS, ToolPolicy};
pub use upstream::{UpstreamEvent, UpstreamHandle};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::class::ServiceClassManager;
use crate::error::rpc_codes;
use crate::events::{EventBus, EventFilter};
use crate::registry::Registry;
use crate::service::{ServiceData, ServiceKind, ServiceState};
use crate::{Error, Result};

/// The seam through which lifecycle tool calls reach tools
///
/// The aggregator is the production implementation; tests substitute mocks.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a tool by public name, returning the raw `tools/call` result
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;

    /// Whether a tool currently exists in the catalog
    fn has_tool(&self, name: &str) -> bool;
}

/// Aggregator tuning knobs
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Per-call dispatch timeout
    pub call_timeout: Duration,
    /// Reconnect backoff base delay
    pub reconnect_base: Duration,
    /// Reconnect backoff cap
    pub reconnect_cap: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

struct Inner {
    upstreams: HashMap<String, Arc<UpstreamHandle>>,
    /// Connect-ordered slices: seq -> (label, prefix, slice)
    slices: BTreeMap<u64, (String, String, UpstreamCatalog)>,
    next_seq: u64,
    version: u64,
}

/// The MCP aggregator
pub struct Aggregator {
    registry: Arc<Registry>,
    classes: Arc<ServiceClassManager>,
    policy: Arc<ToolPolicy>,
    settings: AggregatorSettings,
    inner: Mutex<Inner>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    catalog_tx: watch::Sender<Arc<CatalogSnapshot>>,
    events_tx: mpsc::Sender<UpstreamEvent>,
}

impl Aggregator {
    /// Create the aggregator and spawn its upstream-event loop
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        classes: Arc<ServiceClassManager>,
        policy: Arc<ToolPolicy>,
        settings: AggregatorSettings,
    ) -> Arc<Self> {
        let initial = Arc::new(CatalogSnapshot::default());
        let (catalog_tx, _) = watch::channel(Arc::clone(&initial));
        let (events_tx, events_rx) = mpsc::channel(64);

        let aggregator = Arc::new(Self {
            registry,
            classes,
            policy,
            settings,
            inner: Mutex::new(Inner {
                upstreams: HashMap::new(),
                slices: BTreeMap::new(),
                next_seq: 0,
                version: 0,
            }),
            snapshot: RwLock::new(initial),
            catalog_tx,
            events_tx,
        });

        tokio::spawn(event_loop(Arc::downgrade(&aggregator), events_rx));
        aggregator
    }

    /// Current catalog snapshot
    #[must_use]
    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Watch channel following catalog rebuilds
    #[must_use]
    pub fn subscribe_catalog(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.catalog_tx.subscribe()
    }

    /// Policy handle (yolo switch)
    #[must_use]
    pub fn policy(&self) -> Arc<ToolPolicy> {
        Arc::clone(&self.policy)
    }

    /// Flip yolo mode, rebuilding the catalog's blocked flags
    pub fn set_yolo(&self, yolo: bool) {
        if self.policy.set_yolo(yolo) != yolo {
            info!(yolo, "Yolo mode changed");
            self.rebuild();
        }
    }

    /// Ensure an upstream worker exists for a running MCP server
    pub fn ensure_upstream(&self, label: &str, endpoint: &str, prefix: Option<&str>) {
        let mut inner = self.inner.lock();
        let stale = inner
            .upstreams
            .get(label)
            .map(|h| (h.endpoint.clone(), h.seq));
        if let Some((existing_endpoint, seq)) = stale {
            if existing_endpoint == endpoint {
                return;
            }
            // Endpoint moved (service restarted on a new port); replace.
            if let Some(handle) = inner.upstreams.remove(label) {
                handle.shutdown();
            }
            inner.slices.remove(&seq);
        }

        let prefix = prefix.map_or_else(|| format!("{label}_"), ToString::to_string);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let handle = UpstreamHandle::spawn(
            label.to_string(),
            endpoint.to_string(),
            prefix,
            seq,
            ReconnectBackoff::new(self.settings.reconnect_base, self.settings.reconnect_cap),
            self.events_tx.clone(),
        );
        inner.upstreams.insert(label.to_string(), handle);
        debug!(upstream = %label, endpoint, "Upstream worker spawned");
    }

    /// Tear down an upstream worker and drop its catalog slice
    pub fn remove_upstream(&self, label: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.upstreams.remove(label) {
                handle.shutdown();
                inner.slices.remove(&handle.seq);
                true
            } else {
                false
            }
        };
        if removed {
            info!(upstream = %label, "Upstream removed");
            self.rebuild();
        }
    }

    /// Labels and connection states of all upstreams
    #[must_use]
    pub fn upstreams(&self) -> Vec<(String, bool)> {
        let inner = self.inner.lock();
        let mut list: Vec<(String, bool)> = inner
            .upstreams
            .values()
            .map(|h| (h.label.clone(), h.is_connected()))
            .collect();
        list.sort();
        list
    }

    /// Dispatch a `tools/call` to the owning upstream
    ///
    /// # Errors
    ///
    /// Method-not-found for unknown names, `Blocked` under the destructive
    /// policy, `UpstreamUnavailable` when the owner is not running,
    /// `Timeout` past the per-call limit.
    pub async fn dispatch(&self, public_name: &str, args: Value) -> Result<Value> {
        let snapshot = self.catalog();
        let entry = snapshot.tool(public_name).ok_or_else(|| {
            Error::json_rpc(
                rpc_codes::METHOD_NOT_FOUND,
                format!("Unknown tool: {public_name}"),
            )
        })?;

        if self.policy.blocks(public_name) {
            return Err(Error::Blocked(public_name.to_string()));
        }

        let handle = self
            .inner
            .lock()
            .upstreams
            .get(&entry.upstream)
            .cloned()
            .ok_or_else(|| Error::UpstreamUnavailable(entry.upstream.clone()))?;

        let params = serde_json::json!({
            "name": entry.upstream_name,
            "arguments": args,
        });
        let response = handle
            .request("tools/call", Some(params), self.settings.call_timeout)
            .await?;

        if let Some(err) = response.error {
            return Err(Error::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Read a resource from its owning upstream
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let snapshot = self.catalog();
        let owner = snapshot
            .resource_owner(uri)
            .ok_or_else(|| Error::NotFound(format!("resource {uri}")))?
            .to_string();

        let handle = self
            .inner
            .lock()
            .upstreams
            .get(&owner)
            .cloned()
            .ok_or_else(|| Error::UpstreamUnavailable(owner.clone()))?;

        let response = handle
            .request(
                "resources/read",
                Some(serde_json::json!({ "uri": uri })),
                self.settings.call_timeout,
            )
            .await?;
        if let Some(err) = response.error {
            return Err(Error::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Fetch a prompt from its owning upstream
    pub async fn get_prompt(&self, public_name: &str, args: Option<Value>) -> Result<Value> {
        let snapshot = self.catalog();
        let entry = snapshot
            .prompt(public_name)
            .ok_or_else(|| Error::NotFound(format!("prompt {public_name}")))?;
        let upstream = entry.upstream.clone();
        let local = entry.upstream_name.clone();

        let handle = self
            .inner
            .lock()
            .upstreams
            .get(&upstream)
            .cloned()
            .ok_or_else(|| Error::UpstreamUnavailable(upstream.clone()))?;

        let mut params = serde_json::json!({ "name": local });
        if let Some(args) = args {
            params["arguments"] = args;
        }
        let response = handle
            .request("prompts/get", Some(params), self.settings.call_timeout)
            .await?;
        if let Some(err) = response.error {
            return Err(Error::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Follow the event bus, connecting and disconnecting upstreams as
    /// MCP-server services change state
    pub fn attach_bus(self: &Arc<Self>, bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let mut sub = bus.subscribe(EventFilter::kind(ServiceKind::McpServer));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let Some(aggregator) = weak.upgrade() else { break };
                match event.new_state {
                    ServiceState::Running => aggregator.connect_service(&event.label),
                    ServiceState::Stopping | ServiceState::Failed | ServiceState::Stopped => {
                        aggregator.remove_upstream(&event.label);
                    }
                    _ => {}
                }
            }
        })
    }

    fn connect_service(&self, label: &str) {
        let Some(record) = self.registry.get_record(label) else {
            return;
        };
        let ServiceData::McpServer(data) = &record.data else {
            return;
        };
        let Some(endpoint) = data.endpoint.clone() else {
            warn!(service = %label, "MCP server running without an endpoint; cannot aggregate");
            return;
        };
        let prefix = record
            .class_ref
            .as_ref()
            .and_then(|class| self.classes.get(class))
            .and_then(|def| def.service_config.tool_prefix.clone());
        self.ensure_upstream(label, &endpoint, prefix.as_deref());
    }

    fn on_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Connected { label, catalog } => {
                let known = {
                    let mut inner = self.inner.lock();
                    let slot = inner
                        .upstreams
                        .get(&label)
                        .map(|h| (h.seq, h.prefix.clone()));
                    match slot {
                        Some((seq, prefix)) => {
                            inner.slices.insert(seq, (label.clone(), prefix, catalog));
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    self.rebuild();
                }
            }
            UpstreamEvent::Disconnected { label } => {
                let removed = {
                    let mut inner = self.inner.lock();
                    let seq = inner.upstreams.get(&label).map(|h| h.seq);
                    seq.is_some_and(|seq| inner.slices.remove(&seq).is_some())
                };
                if removed {
                    self.rebuild();
                }
            }
        }
    }

    /// Rebuild the snapshot from current slices and publish catalog-changed
    fn rebuild(&self) {
        let (version, slices) = {
            let mut inner = self.inner.lock();
            inner.version += 1;
            let slices: Vec<(String, String, UpstreamCatalog)> =
                inner.slices.values().cloned().collect();
            (inner.version, slices)
        };

        let snapshot = Arc::new(CatalogSnapshot::build(version, &slices, &self.policy));
        info!(
            version,
            tools = snapshot.tool_count(),
            upstreams = slices.len(),
            "Catalog rebuilt"
        );
        *self.snapshot.write() = Arc::clone(&snapshot);
        let _ = self.catalog_tx.send(snapshot);
    }
}

#[async_trait]
impl ToolInvoker for Aggregator {
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.dispatch(name, args).await
    }

    fn has_tool(&self, name: &str) -> bool {
        self.catalog().tool(name).is_some()
    }
}

async fn event_loop(aggregator: Weak<Aggregator>, mut rx: mpsc::Receiver<UpstreamEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(aggregator) = aggregator.upgrade() else {
            break;
        };
        aggregator.on_upstream_event(event);
    }
}
