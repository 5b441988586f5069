//! Per-service health checking
//!
//! Services whose class binds a health-check tool get a checker loop while
//! they are running. Each tick invokes the tool under the service's
//! transition lock (skipping the tick when a transition holds it), with the
//! class's health timeout. Threshold crossings flip health; a breach marks
//! the service failed and cascades a stop of its dependents.

use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::class::{LifecycleEvent, ServiceClassManager};
use crate::events::{EventBus, EventFilter};
use crate::lifecycle::LifecycleRunner;
use crate::registry::Registry;
use crate::scheduler::DependencyScheduler;
use crate::service::{HealthState, ServiceState};

/// Spawns and cancels health loops as services move through their lifecycle
pub struct HealthMonitor {
    registry: Arc<Registry>,
    classes: Arc<ServiceClassManager>,
    runner: Arc<LifecycleRunner>,
    scheduler: Arc<DependencyScheduler>,
}

impl HealthMonitor {
    /// Wire the monitor to its collaborators
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        classes: Arc<ServiceClassManager>,
        runner: Arc<LifecycleRunner>,
        scheduler: Arc<DependencyScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            classes,
            runner,
            scheduler,
        })
    }

    /// Follow the event bus: running services gain a checker loop, anything
    /// leaving running loses it
    pub fn attach_bus(self: &Arc<Self>, bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let mut sub = bus.subscribe(EventFilter::all());
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if !event.is_transition() {
                    continue;
                }
                match event.new_state {
                    ServiceState::Running => monitor.start_loop(&event.label),
                    ServiceState::Stopping | ServiceState::Stopped | ServiceState::Failed => {
                        if let Some(entry) = monitor.registry.get(&event.label) {
                            entry.cancel_health_loop();
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Start (or restart) the checker loop for one running service
    pub fn start_loop(self: &Arc<Self>, label: &str) {
        let Some(entry) = self.registry.get(label) else {
            return;
        };
        let record = entry.snapshot();
        let Some(class) = record.class_ref.as_ref().and_then(|c| self.classes.get(c)) else {
            return;
        };
        if class.tool_call(LifecycleEvent::HealthCheck).is_none() {
            return;
        }

        entry.cancel_health_loop();
        let token = CancellationToken::new();
        *entry.health_cancel.lock() = Some(token.clone());

        let policy = class.service_config.health_check.clone();
        debug!(
            service = %label,
            interval_ms = policy.interval.as_millis(),
            "Health loop started"
        );
        tokio::spawn(run_loop(
            Arc::downgrade(self),
            label.to_string(),
            policy,
            token,
        ));
    }
}

async fn run_loop(
    weak: Weak<HealthMonitor>,
    label: String,
    policy: crate::class::definition::HealthCheckPolicy,
    token: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    let mut consecutive_successes: u32 = 0;
    let mut recovering = false;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(policy.interval) => {}
        }
        let Some(monitor) = weak.upgrade() else { break };

        match monitor.runner.health_check(&label).await {
            Err(_) => break, // unregistered
            Ok(None) => {}   // transition in flight or no longer running
            Ok(Some(true)) => {
                consecutive_failures = 0;
                consecutive_successes += 1;
                if !recovering || consecutive_successes >= policy.success_threshold {
                    monitor.runner.publish_health(&label, HealthState::Healthy);
                    recovering = false;
                }
            }
            Ok(Some(false)) => {
                consecutive_successes = 0;
                consecutive_failures += 1;
                recovering = true;
                if consecutive_failures >= policy.failure_threshold {
                    warn!(
                        service = %label,
                        failures = consecutive_failures,
                        "Health breach"
                    );
                    let reason = format!(
                        "health check failed {consecutive_failures} consecutive times"
                    );
                    match monitor.runner.mark_failed_from_health(&label, &reason) {
                        Ok(true) => {
                            info!(service = %label, "Cascading stop after health breach");
                            monitor
                                .scheduler
                                .cascade_stop(&label, &CancellationToken::new())
                                .await;
                        }
                        Ok(false) | Err(_) => {}
                    }
                    break;
                }
                monitor.runner.publish_health(&label, HealthState::Degraded);
            }
        }
    }
    debug!(service = %label, "Health loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ToolInvoker;
    use crate::class::fixtures;
    use crate::class::{ServiceClassManager, ToolCall};
    use crate::lifecycle::testing::MockInvoker;
    use crate::service::{ServiceKind, ServiceRecord};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        invoker: Arc<MockInvoker>,
        scheduler: Arc<DependencyScheduler>,
        monitor: Arc<HealthMonitor>,
    }

    fn fixture(interval: Duration, failure_threshold: u32) -> Fixture {
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
        let scheduler = DependencyScheduler::new(Arc::clone(&registry), Arc::clone(&runner), 8);
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&classes),
            Arc::clone(&runner),
            Arc::clone(&scheduler),
        );

        for (label, deps) in [("db", vec![]), ("api", vec!["db"]), ("web", vec!["api"])] {
            let mut class = fixtures::class(label);
            class.service_config.lifecycle_tools.health_check = Some(ToolCall {
                tool: format!("{label}_health"),
                arguments: serde_json::Value::Null,
                outputs: std::collections::BTreeMap::new(),
            });
            class.service_config.health_check.interval = interval;
            class.service_config.health_check.failure_threshold = failure_threshold;
            classes.create(class).unwrap();
            registry
                .register(
                    ServiceRecord::new(label, ServiceKind::Custom(label.into()))
                        .with_class(label)
                        .with_dependencies(deps.into_iter().map(ToString::to_string).collect()),
                )
                .unwrap();
        }

        Fixture {
            registry,
            bus,
            invoker,
            scheduler,
            monitor,
        }
    }

    async fn wait_for_state(
        registry: &Registry,
        label: &str,
        state: ServiceState,
        budget: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if registry.get_record(label).is_some_and(|r| r.state == state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn healthy_checks_mark_healthy() {
        let f = fixture(Duration::from_millis(20), 3);
        let _watch = f.monitor.attach_bus(&f.bus);

        f.scheduler
            .start_service("db", &CancellationToken::new())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if f.registry
                .get_record("db")
                .is_some_and(|r| r.health == HealthState::Healthy)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never became healthy");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.invoker.call_names().contains(&"db_health".to_string()));
    }

    #[tokio::test]
    async fn breach_fails_service_and_cascades() {
        let f = fixture(Duration::from_millis(20), 3);
        let _watch = f.monitor.attach_bus(&f.bus);

        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();

        // Break only api's health tool.
        f.invoker.fail.lock().insert("api_health".to_string());

        assert!(
            wait_for_state(&f.registry, "api", ServiceState::Failed, Duration::from_secs(3)).await
        );
        assert!(
            wait_for_state(&f.registry, "web", ServiceState::Stopped, Duration::from_secs(3)).await
        );
        // db is below the breach and stays running.
        assert_eq!(
            f.registry.get_record("db").unwrap().state,
            ServiceState::Running
        );
        assert_eq!(
            f.registry.get_record("api").unwrap().health,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn loop_cancelled_on_stop() {
        let f = fixture(Duration::from_millis(20), 3);
        let _watch = f.monitor.attach_bus(&f.bus);

        f.scheduler
            .start_service("db", &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        f.scheduler
            .stop_service("db", &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let checks_after_stop = f
            .invoker
            .call_names()
            .iter()
            .filter(|n| *n == "db_health")
            .count();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let later = f
            .invoker
            .call_names()
            .iter()
            .filter(|n| *n == "db_health")
            .count();
        assert_eq!(checks_after_stop, later, "health loop kept running after stop");
    }
}
