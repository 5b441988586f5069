//! Dependency-aware scheduler
//!
//! Orders lifecycle requests across the service graph. Starts walk the
//! dependency closure leaves-first (Kahn levels); stops walk the dependent
//! closure roots-first. Siblings within a level run concurrently, bounded
//! by the parallelism cap, and the scheduler waits for a level to settle
//! before moving on. Labels sort ascending for deterministic ordering.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleRunner;
use crate::registry::Registry;
use crate::service::ServiceState;
use crate::{Error, Result};

/// Default sibling-concurrency cap within a topological level
pub const DEFAULT_PARALLELISM: usize = 8;

/// Topologically ordered start/stop execution
pub struct DependencyScheduler {
    registry: Arc<Registry>,
    runner: Arc<LifecycleRunner>,
    parallelism: usize,
}

impl DependencyScheduler {
    /// Wire a scheduler to the registry and transition runner
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        runner: Arc<LifecycleRunner>,
        parallelism: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            runner,
            parallelism: parallelism.max(1),
        })
    }

    /// Start a service after starting its transitive dependencies,
    /// leaves-first
    ///
    /// # Errors
    ///
    /// `DependencyFailed` when any dependency fails; dependencies already
    /// started stay running (no rollback).
    pub async fn start_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.registry.get_required(label)?;
        let closure = self.dependency_closure(label);
        let levels = topo_levels(&closure, |l| self.registry.dependencies_of(l));
        debug!(service = %label, services = closure.len(), levels = levels.len(), "Start plan");

        for level in levels {
            // Already-running members are skipped outright.
            let pending: Vec<String> = level
                .into_iter()
                .filter(|l| {
                    self.registry
                        .get_record(l)
                        .is_some_and(|r| r.state != ServiceState::Running)
                })
                .collect();
            if pending.is_empty() {
                continue;
            }

            let results = self
                .run_level(pending, cancel, |runner, l, c| async move {
                    runner.start(&l, &c).await
                })
                .await;

            if let Some((failed, error)) = first_failure(results) {
                if failed == label {
                    return Err(error);
                }
                return Err(Error::DependencyFailed {
                    label: failed,
                    reason: error.to_string(),
                });
            }
        }

        info!(service = %label, "Start complete");
        Ok(())
    }

    /// Stop a service after stopping everything that depends on it,
    /// roots-first
    pub async fn stop_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.registry.get_required(label)?;
        let closure = self.dependent_closure(label, true);
        let levels = topo_levels(&closure, |l| self.registry.dependencies_of(l));
        debug!(service = %label, services = closure.len(), "Stop plan");

        // Reverse of start order: most-dependent level first.
        for level in levels.into_iter().rev() {
            let results = self
                .run_level(level, cancel, |runner, l, c| async move {
                    runner.stop(&l, &c).await
                })
                .await;
            if let Some((failed, error)) = first_failure(results) {
                if failed == label {
                    return Err(error);
                }
                return Err(Error::DependencyFailed {
                    label: failed,
                    reason: error.to_string(),
                });
            }
        }

        info!(service = %label, "Stop complete");
        Ok(())
    }

    /// Stop then start, with the same ordering rules
    pub async fn restart_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.stop_service(label, cancel).await?;
        self.start_service(label, cancel).await
    }

    /// Best-effort stop of everything depending on a breached service,
    /// roots-first; the breached service itself is left alone
    pub async fn cascade_stop(&self, label: &str, cancel: &CancellationToken) {
        let closure = self.dependent_closure(label, false);
        if closure.is_empty() {
            return;
        }
        info!(service = %label, dependents = closure.len(), "Cascading stop of dependents");

        let levels = topo_levels(&closure, |l| self.registry.dependencies_of(l));
        for level in levels.into_iter().rev() {
            let results = self
                .run_level(level, cancel, |runner, l, c| async move {
                    runner.stop(&l, &c).await
                })
                .await;
            for (dependent, result) in results {
                if let Err(e) = result {
                    warn!(service = %dependent, error = %e, "Cascaded stop failed");
                }
            }
        }
    }

    /// Stop every registered service, roots-first
    pub async fn stop_all(&self, cancel: &CancellationToken) {
        let nodes: BTreeSet<String> = self.registry.labels().into_iter().collect();
        let levels = topo_levels(&nodes, |l| self.registry.dependencies_of(l));
        for level in levels.into_iter().rev() {
            let results = self
                .run_level(level, cancel, |runner, l, c| async move {
                    runner.stop(&l, &c).await
                })
                .await;
            for (label, result) in results {
                if let Err(e) = result {
                    warn!(service = %label, error = %e, "Stop failed during shutdown");
                }
            }
        }
    }

    /// Run one topological level with bounded concurrency, collecting every
    /// member's outcome
    async fn run_level<F, Fut>(
        &self,
        level: Vec<String>,
        cancel: &CancellationToken,
        op: F,
    ) -> Vec<(String, Result<()>)>
    where
        F: Fn(Arc<LifecycleRunner>, String, CancellationToken) -> Fut + Copy,
        Fut: Future<Output = Result<()>>,
    {
        stream::iter(level.into_iter().map(|label| {
            let runner = Arc::clone(&self.runner);
            let cancel = cancel.clone();
            async move {
                let result = op(runner, label.clone(), cancel).await;
                (label, result)
            }
        }))
        .buffer_unordered(self.parallelism)
        .collect()
        .await
    }

    /// `label` plus its transitive dependencies
    fn dependency_closure(&self, label: &str) -> BTreeSet<String> {
        self.closure(label, true, |l| self.registry.dependencies_of(l))
    }

    /// Transitive dependents of `label`, optionally including it
    fn dependent_closure(&self, label: &str, include_self: bool) -> BTreeSet<String> {
        self.closure(label, include_self, |l| self.registry.dependents_of(l))
    }

    fn closure(
        &self,
        label: &str,
        include_self: bool,
        edges: impl Fn(&str) -> Vec<String>,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([label.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for next in edges(&current) {
                if !seen.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        if !include_self {
            seen.remove(label);
        }
        seen
    }
}

/// Group nodes into Kahn levels, leaves (no in-closure dependencies) first.
/// Each level is sorted ascending for determinism. Edges leaving the node
/// set are ignored; the registry guarantees acyclicity.
fn topo_levels(nodes: &BTreeSet<String>, deps_of: impl Fn(&str) -> Vec<String>) -> Vec<Vec<String>> {
    let mut remaining: BTreeMap<String, BTreeSet<String>> = nodes
        .iter()
        .map(|node| {
            let deps: BTreeSet<String> = deps_of(node)
                .into_iter()
                .filter(|d| nodes.contains(d))
                .collect();
            (node.clone(), deps)
        })
        .collect();

    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(node, _)| node.clone())
            .collect();
        if ready.is_empty() {
            // Unreachable with a registry-validated DAG; bail rather than spin.
            warn!("Dependency graph unexpectedly cyclic; remaining nodes scheduled together");
            let mut rest: Vec<String> = remaining.into_keys().collect();
            rest.sort();
            levels.push(rest);
            break;
        }
        for node in &ready {
            remaining.remove(node);
        }
        for deps in remaining.values_mut() {
            for node in &ready {
                deps.remove(node);
            }
        }
        levels.push(ready);
    }
    levels
}

fn first_failure(results: Vec<(String, Result<()>)>) -> Option<(String, Error)> {
    let mut failures: Vec<(String, Error)> = results
        .into_iter()
        .filter_map(|(label, result)| result.err().map(|e| (label, e)))
        .collect();
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    failures.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ToolInvoker;
    use crate::class::{ServiceClassManager, fixtures};
    use crate::events::{EventBus, EventFilter};
    use crate::lifecycle::testing::MockInvoker;
    use crate::service::{ServiceKind, ServiceRecord};
    use pretty_assertions::assert_eq;

    struct Fixture {
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        invoker: Arc<MockInvoker>,
        scheduler: Arc<DependencyScheduler>,
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
        let scheduler = DependencyScheduler::new(Arc::clone(&registry), runner, 8);

        for (label, deps) in [("db", vec![]), ("api", vec!["db"]), ("web", vec!["api"])] {
            classes.create(fixtures::class(label)).unwrap();
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
        }
    }

    #[test]
    fn topo_levels_orders_leaves_first() {
        let nodes: BTreeSet<String> =
            ["a", "b", "c", "d"].iter().map(ToString::to_string).collect();
        // a -> b -> d, a -> c -> d
        let deps = |l: &str| -> Vec<String> {
            match l {
                "a" => vec!["b".into(), "c".into()],
                "b" | "c" => vec!["d".into()],
                _ => vec![],
            }
        };
        let levels = topo_levels(&nodes, deps);
        assert_eq!(
            levels,
            vec![
                vec!["d".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["a".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn start_runs_dependencies_leaves_first() {
        let f = fixture();
        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            f.invoker.call_names(),
            vec!["db_start".to_string(), "api_start".to_string(), "web_start".to_string()]
        );
        for label in ["db", "api", "web"] {
            assert_eq!(
                f.registry.get_record(label).unwrap().state,
                ServiceState::Running
            );
        }
    }

    #[tokio::test]
    async fn start_skips_running_dependencies() {
        let f = fixture();
        f.scheduler
            .start_service("db", &CancellationToken::new())
            .await
            .unwrap();
        f.invoker.calls.lock().clear();

        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            f.invoker.call_names(),
            vec!["api_start".to_string(), "web_start".to_string()]
        );
    }

    #[tokio::test]
    async fn dependency_failure_aborts_without_rollback() {
        let f = fixture();
        f.invoker.fail.lock().insert("api_start".to_string());

        let err = f
            .scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyFailed { label, .. } if label == "api"));

        // db stays running, api failed, web untouched.
        assert_eq!(f.registry.get_record("db").unwrap().state, ServiceState::Running);
        assert_eq!(f.registry.get_record("api").unwrap().state, ServiceState::Failed);
        assert_eq!(f.registry.get_record("web").unwrap().state, ServiceState::Stopped);
        assert!(!f.invoker.call_names().contains(&"web_start".to_string()));
    }

    #[tokio::test]
    async fn stop_walks_dependents_roots_first() {
        let f = fixture();
        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();
        f.invoker.calls.lock().clear();

        f.scheduler
            .stop_service("db", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            f.invoker.call_names(),
            vec!["web_stop".to_string(), "api_stop".to_string(), "db_stop".to_string()]
        );
    }

    #[tokio::test]
    async fn restart_is_stop_then_start() {
        let f = fixture();
        f.scheduler
            .start_service("api", &CancellationToken::new())
            .await
            .unwrap();
        f.invoker.calls.lock().clear();

        f.scheduler
            .restart_service("api", &CancellationToken::new())
            .await
            .unwrap();
        // Stop touches api (no running dependents beyond it), start skips
        // the still-running db.
        assert_eq!(
            f.invoker.call_names(),
            vec!["api_stop".to_string(), "api_start".to_string()]
        );
    }

    #[tokio::test]
    async fn cascade_stop_spares_the_breached_node() {
        let f = fixture();
        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();
        f.invoker.calls.lock().clear();

        f.scheduler.cascade_stop("api", &CancellationToken::new()).await;

        assert_eq!(f.invoker.call_names(), vec!["web_stop".to_string()]);
        assert_eq!(f.registry.get_record("web").unwrap().state, ServiceState::Stopped);
        assert_eq!(f.registry.get_record("api").unwrap().state, ServiceState::Running);
    }

    #[tokio::test]
    async fn events_arrive_in_topological_order_for_one_subscriber() {
        let f = fixture();
        let mut sub = f.bus.subscribe(EventFilter::all());

        f.scheduler
            .start_service("web", &CancellationToken::new())
            .await
            .unwrap();

        let running_order: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .filter(|e| e.new_state == ServiceState::Running)
            .map(|e| e.label)
            .collect();
        assert_eq!(
            running_order,
            vec!["db".to_string(), "api".to_string(), "web".to_string()]
        );
    }

    #[tokio::test]
    async fn siblings_start_concurrently_within_cap() {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(EventBus::new());
        let classes = Arc::new(ServiceClassManager::new());
        let invoker = MockInvoker::new();
        *invoker.delay.lock() = Some(std::time::Duration::from_millis(100));
        let runner = LifecycleRunner::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&classes),
            Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
        );
        let scheduler = DependencyScheduler::new(Arc::clone(&registry), runner, 8);

        classes.create(fixtures::class("s")).unwrap();
        let deps: Vec<String> = (0..4).map(|i| format!("dep{i}")).collect();
        for dep in &deps {
            registry
                .register(ServiceRecord::new(dep, ServiceKind::Custom("s".into())).with_class("s"))
                .unwrap();
        }
        registry
            .register(
                ServiceRecord::new("top", ServiceKind::Custom("s".into()))
                    .with_class("s")
                    .with_dependencies(deps),
            )
            .unwrap();

        let started = std::time::Instant::now();
        scheduler
            .start_service("top", &CancellationToken::new())
            .await
            .unwrap();
        // Four 100ms siblings in parallel plus the top: well under the
        // 500ms a serial walk would take.
        assert!(started.elapsed() < std::time::Duration::from_millis(450));
    }
}
