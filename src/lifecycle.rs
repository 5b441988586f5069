//! Lifecycle state machine runner
//!
//! Drives single-service transitions: renders the class's lifecycle tool
//! call, invokes it through the tool-invoker seam with the class timeout,
//! destructures the response into service data, and publishes the state
//! change. The per-service transition lock gives the at-most-one-in-flight
//! guarantee: a concurrent request observes `TransitionInFlight` instead of
//! duplicating work. Start on a running service is a success with zero tool
//! calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::ToolInvoker;
use crate::class::template::{self, FieldPath, TemplateContext};
use crate::class::{LifecycleEvent, ServiceClassDef, ServiceClassManager, ToolCall};
use crate::events::{EventBus, state_change};
use crate::registry::{Registry, ServiceEntry};
use crate::service::{HealthState, ServiceState};
use crate::{Error, Result};

/// Single-service transition engine
pub struct LifecycleRunner {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    classes: Arc<ServiceClassManager>,
    invoker: Arc<dyn ToolInvoker>,
}

impl LifecycleRunner {
    /// Wire a runner to its collaborators
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        classes: Arc<ServiceClassManager>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            classes,
            invoker,
        })
    }

    /// The tool-invoker seam (shared with the health monitor)
    #[must_use]
    pub fn invoker(&self) -> Arc<dyn ToolInvoker> {
        Arc::clone(&self.invoker)
    }

    /// Start one service
    ///
    /// # Errors
    ///
    /// `TransitionInFlight` under a concurrent transition; tool, timeout,
    /// and cancellation failures mark the service failed and propagate.
    pub async fn start(self: &Arc<Self>, label: &str, cancel: &CancellationToken) -> Result<()> {
        let entry = self.registry.get_required(label)?;
        let Ok(_guard) = entry.transition.try_lock() else {
            return Err(Error::TransitionInFlight(label.to_string()));
        };

        let record = entry.snapshot();
        match record.state {
            ServiceState::Running => {
                debug!(service = %label, "Start on running service, nothing to do");
                return Ok(());
            }
            state if state.startable() => {}
            state => {
                return Err(Error::validation(
                    "state",
                    format!("cannot start service '{label}' in state '{state}'"),
                ));
            }
        }

        let class = record.class_ref.as_ref().and_then(|c| self.classes.get(c));
        self.set_state(&entry, ServiceState::Starting, None, None);
        info!(service = %label, "Starting");

        let result = match &class {
            Some(class) => {
                self.invoke(
                    &entry,
                    class,
                    LifecycleEvent::Start,
                    class.service_config.timeouts.start,
                    cancel,
                )
                .await
            }
            // Classless services (the aggregator itself, native kinds) flip
            // state without a tool call.
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                entry.record.write().retry_attempts = 0;
                self.set_state(&entry, ServiceState::Running, None, None);
                info!(service = %label, "Running");
                Ok(())
            }
            Err(e) => {
                warn!(service = %label, error = %e, "Start failed");
                self.set_state(&entry, ServiceState::Failed, None, Some(e.to_string()));
                if let Some(class) = class {
                    self.schedule_retry(&entry, &class);
                }
                Err(e)
            }
        }
    }

    /// Stop one service
    ///
    /// Stop on a stopped or failed service is a success with zero tool calls.
    pub async fn stop(self: &Arc<Self>, label: &str, cancel: &CancellationToken) -> Result<()> {
        let entry = self.registry.get_required(label)?;
        let Ok(_guard) = entry.transition.try_lock() else {
            return Err(Error::TransitionInFlight(label.to_string()));
        };

        let record = entry.snapshot();
        match record.state {
            ServiceState::Stopped | ServiceState::Failed => {
                debug!(service = %label, state = %record.state, "Stop with nothing to do");
                return Ok(());
            }
            // A pending retry is abandoned by leaving the retrying state.
            ServiceState::Retrying => {
                self.set_state(&entry, ServiceState::Stopped, Some(HealthState::Unknown), None);
                return Ok(());
            }
            ServiceState::Running => {}
            state => {
                return Err(Error::validation(
                    "state",
                    format!("cannot stop service '{label}' in state '{state}'"),
                ));
            }
        }

        entry.cancel_health_loop();
        let class = record.class_ref.as_ref().and_then(|c| self.classes.get(c));
        self.set_state(&entry, ServiceState::Stopping, None, None);
        info!(service = %label, "Stopping");

        let result = match &class {
            Some(class) => {
                self.invoke(
                    &entry,
                    class,
                    LifecycleEvent::Stop,
                    class.service_config.timeouts.stop,
                    cancel,
                )
                .await
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.set_state(&entry, ServiceState::Stopped, Some(HealthState::Unknown), None);
                info!(service = %label, "Stopped");
                Ok(())
            }
            Err(e) => {
                warn!(service = %label, error = %e, "Stop failed");
                self.set_state(&entry, ServiceState::Failed, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Run the class's health-check tool once, under the transition lock
    ///
    /// Returns `None` when a transition is in flight (the tick is skipped).
    pub async fn health_check(&self, label: &str) -> Result<Option<bool>> {
        let entry = self.registry.get_required(label)?;
        let Ok(_guard) = entry.transition.try_lock() else {
            return Ok(None);
        };

        let record = entry.snapshot();
        if record.state != ServiceState::Running {
            return Ok(None);
        }
        let Some(class) = record.class_ref.as_ref().and_then(|c| self.classes.get(c)) else {
            return Ok(None);
        };
        let Some(call) = class.tool_call(LifecycleEvent::HealthCheck) else {
            return Ok(None);
        };

        entry.record.write().health = HealthState::Checking;
        let outcome = self
            .run_tool(&entry, call, class.service_config.timeouts.health_check, &CancellationToken::new())
            .await;
        entry.record.write().last_checked = Some(Utc::now());

        Ok(Some(outcome.is_ok()))
    }

    /// Mark a running service failed after a health breach
    ///
    /// Skipped silently when a transition is in flight or the service is no
    /// longer running.
    pub fn mark_failed_from_health(&self, label: &str, reason: &str) -> Result<bool> {
        let entry = self.registry.get_required(label)?;
        let Ok(_guard) = entry.transition.try_lock() else {
            return Ok(false);
        };
        if entry.record.read().state != ServiceState::Running {
            return Ok(false);
        }
        self.set_state(
            &entry,
            ServiceState::Failed,
            Some(HealthState::Unhealthy),
            Some(reason.to_string()),
        );
        Ok(true)
    }

    /// Publish a health-only change (state unchanged)
    pub fn publish_health(&self, label: &str, health: HealthState) {
        let Some(entry) = self.registry.get(label) else {
            return;
        };
        let event = {
            let mut record = entry.record.write();
            if record.health == health {
                return;
            }
            record.health = health;
            record.updated_at = Utc::now();
            state_change(
                &record.label,
                record.kind.clone(),
                record.state,
                record.state,
                health,
                None,
            )
        };
        self.bus.publish(&event);
    }

    /// Force a service to stopped during unregister, with a best-effort stop
    pub async fn force_stop(self: &Arc<Self>, label: &str) {
        let Some(entry) = self.registry.get(label) else {
            return;
        };
        entry.cancel_health_loop();

        // Best effort: take the transition lock when free, stop through the
        // class tool if one applies, and force the state either way.
        if entry.record.read().state == ServiceState::Running {
            let cancel = CancellationToken::new();
            if let Err(e) = self.stop(label, &cancel).await {
                warn!(service = %label, error = %e, "Best-effort stop failed during unregister");
            }
        }
        let record = entry.snapshot();
        if record.state != ServiceState::Stopped {
            self.set_state(&entry, ServiceState::Stopped, Some(HealthState::Unknown), None);
        }
    }

    async fn invoke(
        &self,
        entry: &Arc<ServiceEntry>,
        class: &ServiceClassDef,
        event: LifecycleEvent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(call) = class.tool_call(event) else {
            return Ok(());
        };
        if !self.invoker.has_tool(&call.tool) {
            return Err(Error::ClassUnavailable {
                class: class.name.clone(),
                missing: vec![call.tool.clone()],
            });
        }
        self.run_tool(entry, call, timeout, cancel).await
    }

    async fn run_tool(
        &self,
        entry: &Arc<ServiceEntry>,
        call: &ToolCall,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = entry.snapshot();
        let ctx = TemplateContext::new(
            &record.label,
            &record.creation_parameters,
            &record.data.as_json(),
        )
        .with_service_id(record.service_id.as_deref());
        let args = match &call.arguments {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => template::render(other, &ctx)?,
        };

        let invocation = self.invoker.call_tool(&call.tool, args);
        let value = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "{} call for '{}'", call.tool, record.label
                )));
            }
            result = tokio::time::timeout(timeout, invocation) => match result {
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "{} exceeded {}ms for '{}'",
                        call.tool,
                        timeout.as_millis(),
                        record.label
                    )));
                }
                Ok(value) => value?,
            },
        };

        self.apply_outputs(entry, call, &value);
        Ok(())
    }

    /// Destructure a tool response through the call's output mapping
    fn apply_outputs(&self, entry: &Arc<ServiceEntry>, call: &ToolCall, value: &Value) {
        if call.outputs.is_empty() {
            return;
        }
        let mut record = entry.record.write();
        for (target, path) in &call.outputs {
            let Ok(compiled) = FieldPath::compile(path) else {
                continue; // validated at class load
            };
            let Some(extracted) = compiled.extract(value) else {
                debug!(
                    service = %record.label,
                    target,
                    path,
                    "Response field missing, mapping skipped"
                );
                continue;
            };
            match target.as_str() {
                "serviceId" => {
                    record.service_id = extracted.as_str().map(ToString::to_string);
                }
                "health" => {
                    if let Some(parsed) = extracted.as_str().and_then(HealthState::parse) {
                        record.health = parsed;
                    }
                }
                _ => {
                    let extracted = extracted.clone();
                    if let Err(e) = record.data.apply_field(target, extracted) {
                        warn!(service = %record.label, target, error = %e, "Response mapping rejected");
                    }
                }
            }
        }
        record.updated_at = Utc::now();
    }

    /// Update state, keep the `last_error` invariant, publish the change
    fn set_state(
        &self,
        entry: &Arc<ServiceEntry>,
        new_state: ServiceState,
        health: Option<HealthState>,
        error: Option<String>,
    ) {
        let event = {
            let mut record = entry.record.write();
            let old_state = record.state;
            debug_assert!(
                old_state.can_transition_to(new_state)
                    || new_state == ServiceState::Stopped
                    || old_state == new_state,
                "illegal transition {old_state} -> {new_state}"
            );
            record.state = new_state;
            if let Some(health) = health {
                record.health = health;
            }
            record.last_error = if new_state == ServiceState::Failed {
                error.or_else(|| Some("unknown failure".to_string()))
            } else {
                None
            };
            record.updated_at = Utc::now();
            state_change(
                &record.label,
                record.kind.clone(),
                old_state,
                new_state,
                record.health,
                record.last_error.clone(),
            )
        };
        self.bus.publish(&event);
    }

    /// Schedule an automatic retry after a failed start, per class policy
    fn schedule_retry(self: &Arc<Self>, entry: &Arc<ServiceEntry>, class: &ServiceClassDef) {
        let retry = &class.service_config.retry;
        if !retry.enabled {
            return;
        }
        let attempts = {
            let mut record = entry.record.write();
            record.retry_attempts += 1;
            record.retry_attempts
        };
        if attempts > retry.max_attempts {
            warn!(
                service = %entry.label(),
                attempts,
                "Retry budget exhausted"
            );
            return;
        }

        self.set_state(entry, ServiceState::Retrying, None, None);
        let runner = Arc::clone(self);
        let label = entry.label();
        let backoff = retry.backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            // A stop during the backoff abandons the retry.
            let still_retrying = runner
                .registry
                .get_record(&label)
                .is_some_and(|r| r.state == ServiceState::Retrying);
            if !still_retrying {
                return;
            }
            debug!(service = %label, "Retrying start");
            let _ = runner.start(&label, &CancellationToken::new()).await;
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockInvoker;
    use super::*;
    use crate::class::fixtures;
    use crate::events::EventFilter;
    use crate::service::{ServiceKind, ServiceRecord};
    use serde_json::json;

    struct Fixture {
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        classes: Arc<ServiceClassManager>,
        invoker: Arc<MockInvoker>,
        runner: Arc<LifecycleRunner>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(EventBus::new());
        let classes = Arc::new(ServiceClassManager::new());
        let invoker = MockInvoker::new();
        let runner = LifecycleRunner::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&classes),
            Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
        );
        Fixture {
            registry,
            bus,
            classes,
            invoker,
            runner,
        }
    }

    fn register_classed(f: &Fixture, label: &str, class: &str) {
        f.classes.create(fixtures::class(class)).ok();
        f.registry
            .register(
                ServiceRecord::new(label, ServiceKind::Custom(class.into())).with_class(class),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn start_invokes_tool_and_reaches_running() {
        let f = fixture();
        register_classed(&f, "db", "db");

        f.runner.start("db", &CancellationToken::new()).await.unwrap();

        assert_eq!(f.invoker.call_names(), vec!["db_start".to_string()]);
        let record = f.registry.get_record("db").unwrap();
        assert_eq!(record.state, ServiceState::Running);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn start_on_running_is_idempotent_with_zero_calls() {
        let f = fixture();
        register_classed(&f, "db", "db");
        f.runner.start("db", &CancellationToken::new()).await.unwrap();
        f.invoker.calls.lock().clear();

        f.runner.start("db", &CancellationToken::new()).await.unwrap();
        assert!(f.invoker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_start_sets_failed_with_error() {
        let f = fixture();
        register_classed(&f, "db", "db");
        f.invoker.fail.lock().insert("db_start".to_string());

        let err = f.runner.start("db", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let record = f.registry.get_record("db").unwrap();
        assert_eq!(record.state, ServiceState::Failed);
        assert!(record.last_error.as_deref().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn concurrent_start_gets_transition_in_flight() {
        let f = fixture();
        register_classed(&f, "db", "db");
        *f.invoker.delay.lock() = Some(Duration::from_millis(200));

        let runner = Arc::clone(&f.runner);
        let first = tokio::spawn(async move {
            runner.start("db", &CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = f.runner.start("db", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::TransitionInFlight(_)));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_produces_distinct_error_class() {
        let f = fixture();
        let mut class = fixtures::class("db");
        class.service_config.timeouts.start = Duration::from_millis(50);
        f.classes.create(class).unwrap();
        f.registry
            .register(ServiceRecord::new("db", ServiceKind::Custom("db".into())).with_class("db"))
            .unwrap();
        *f.invoker.delay.lock() = Some(Duration::from_millis(500));

        let err = f.runner.start("db", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(
            f.registry.get_record("db").unwrap().state,
            ServiceState::Failed
        );
    }

    #[tokio::test]
    async fn cancellation_fails_the_start() {
        let f = fixture();
        register_classed(&f, "db", "db");
        *f.invoker.delay.lock() = Some(Duration::from_millis(500));

        let cancel = CancellationToken::new();
        let runner = Arc::clone(&f.runner);
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.start("db", &token).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(
            f.registry.get_record("db").unwrap().state,
            ServiceState::Failed
        );
    }

    #[tokio::test]
    async fn stop_round_trip_publishes_events_in_order() {
        let f = fixture();
        register_classed(&f, "db", "db");
        let mut sub = f.bus.subscribe(EventFilter::all());

        f.runner.start("db", &CancellationToken::new()).await.unwrap();
        f.runner.stop("db", &CancellationToken::new()).await.unwrap();

        let states: Vec<ServiceState> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.new_state)
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceState::Starting,
                ServiceState::Running,
                ServiceState::Stopping,
                ServiceState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn outputs_populate_service_data_and_service_id() {
        let f = fixture();
        let mut class = fixtures::class("srv");
        class.service_config.service_type = Some("mcp-server".into());
        class
            .service_config
            .lifecycle_tools
            .start
            .outputs
            .extend([
                ("endpoint".to_string(), "result.url".to_string()),
                ("serviceId".to_string(), "result.id".to_string()),
                ("health".to_string(), "result.health".to_string()),
            ]);
        f.classes.create(class).unwrap();
        f.registry
            .register(ServiceRecord::new("u1", ServiceKind::McpServer).with_class("srv"))
            .unwrap();
        *f.invoker.response.lock() = json!({
            "result": {"url": "http://localhost:9901", "id": "srv-1", "health": "healthy"}
        });

        f.runner.start("u1", &CancellationToken::new()).await.unwrap();

        let record = f.registry.get_record("u1").unwrap();
        assert_eq!(record.service_id.as_deref(), Some("srv-1"));
        assert_eq!(record.health, HealthState::Healthy);
        assert_eq!(record.data.as_json()["endpoint"], "http://localhost:9901");
    }

    #[tokio::test]
    async fn classless_service_flips_without_tool_calls() {
        let f = fixture();
        f.registry
            .register(ServiceRecord::new("agg", ServiceKind::Aggregator))
            .unwrap();

        f.runner.start("agg", &CancellationToken::new()).await.unwrap();
        assert!(f.invoker.calls.lock().is_empty());
        assert_eq!(
            f.registry.get_record("agg").unwrap().state,
            ServiceState::Running
        );
    }

    #[tokio::test]
    async fn retry_policy_drives_failed_through_retrying_to_running() {
        let f = fixture();
        let mut class = fixtures::class("db");
        class.service_config.retry.enabled = true;
        class.service_config.retry.max_attempts = 2;
        class.service_config.retry.backoff = Duration::from_millis(50);
        f.classes.create(class).unwrap();
        f.registry
            .register(ServiceRecord::new("db", ServiceKind::Custom("db".into())).with_class("db"))
            .unwrap();
        f.invoker.fail.lock().insert("db_start".to_string());

        let _ = f.runner.start("db", &CancellationToken::new()).await;
        assert_eq!(
            f.registry.get_record("db").unwrap().state,
            ServiceState::Retrying
        );

        // Let the retry fire with the failure cleared.
        f.invoker.fail.lock().clear();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.registry.get_record("db").unwrap().state,
            ServiceState::Running
        );
    }

    #[tokio::test]
    async fn mark_failed_from_health_only_hits_running_services() {
        let f = fixture();
        register_classed(&f, "db", "db");
        assert!(!f.runner.mark_failed_from_health("db", "boom").unwrap());

        f.runner.start("db", &CancellationToken::new()).await.unwrap();
        assert!(f.runner.mark_failed_from_health("db", "boom").unwrap());

        let record = f.registry.get_record("db").unwrap();
        assert_eq!(record.state, ServiceState::Failed);
        assert_eq!(record.health, HealthState::Unhealthy);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }
}
