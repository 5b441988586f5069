//! Service orchestrator
//!
//! The public surface the CLI, TUI, and control-plane tools drive.
//! Instantiates services from classes (parameter validation, label
//! templating, dependency resolution), delegates lifecycle requests to the
//! scheduler, and passes event subscriptions through from the bus.
//!
//! Everything arrives by constructor injection; there is no process-wide
//! state.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::class::template::{self, TemplateContext};
use crate::class::{ServiceClassDef, ServiceClassManager};
use crate::events::{EventBus, EventFilter, Subscription};
use crate::lifecycle::LifecycleRunner;
use crate::registry::Registry;
use crate::scheduler::DependencyScheduler;
use crate::service::{ServiceRecord, ServiceState};
use crate::{Error, Result};

/// Orchestrates service instances over the registry, scheduler, and bus
pub struct Orchestrator {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    classes: Arc<ServiceClassManager>,
    runner: Arc<LifecycleRunner>,
    scheduler: Arc<DependencyScheduler>,
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        classes: Arc<ServiceClassManager>,
        runner: Arc<LifecycleRunner>,
        scheduler: Arc<DependencyScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            classes,
            runner,
            scheduler,
        })
    }

    /// The registry this orchestrator manages
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// The class manager behind `classRef` resolution
    #[must_use]
    pub fn classes(&self) -> Arc<ServiceClassManager> {
        Arc::clone(&self.classes)
    }

    /// Create a service instance from a class
    ///
    /// Registers the instance in `stopped`; starting is an explicit
    /// follow-up.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown class, `ClassUnavailable` when required
    /// tools are missing, `Validation` for bad parameters or an
    /// unresolvable label/dependency, `AlreadyRegistered` on a duplicate
    /// label.
    pub fn create_service(
        &self,
        class_name: &str,
        label: Option<String>,
        parameters: Map<String, Value>,
    ) -> Result<ServiceRecord> {
        let class = self
            .classes
            .get(class_name)
            .ok_or_else(|| Error::NotFound(format!("service class '{class_name}'")))?;
        if !self.classes.is_available(class_name) {
            return Err(Error::ClassUnavailable {
                class: class_name.to_string(),
                missing: self.classes.missing_tools(class_name),
            });
        }

        let parameters = validate_parameters(&class, parameters)?;
        let label = match label {
            Some(label) if !label.trim().is_empty() => label,
            _ => render_default_label(&class, &parameters)?,
        };
        let dependencies = self.resolve_dependencies(&class)?;

        let record = ServiceRecord::new(&label, class.kind())
            .with_class(class_name)
            .with_parameters(parameters)
            .with_dependencies(dependencies);

        let entry = self.registry.register(record)?;
        info!(service = %label, class = %class_name, "Service created");
        Ok(entry.snapshot())
    }

    /// Delete a service instance
    ///
    /// # Errors
    ///
    /// `ServiceBusy` unless the service is stopped or failed.
    pub fn delete_service(&self, label: &str) -> Result<()> {
        let entry = self.registry.get_required(label)?;
        let state = entry.record.read().state;
        if !matches!(state, ServiceState::Stopped | ServiceState::Failed) {
            return Err(Error::ServiceBusy(label.to_string()));
        }
        entry.cancel_health_loop();
        self.registry.unregister(label)?;
        info!(service = %label, "Service deleted");
        Ok(())
    }

    /// Force-remove a service: best-effort stop, then unregister
    pub async fn remove_service(&self, label: &str) -> Result<()> {
        self.registry.get_required(label)?;
        self.runner.force_stop(label).await;
        self.registry.unregister(label)?;
        info!(service = %label, "Service removed");
        Ok(())
    }

    /// Start a service and its dependencies
    pub async fn start_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.scheduler.start_service(label, cancel).await
    }

    /// Stop a service and its dependents
    pub async fn stop_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.scheduler.stop_service(label, cancel).await
    }

    /// Restart a service (stop, then start, same ordering rules)
    pub async fn restart_service(&self, label: &str, cancel: &CancellationToken) -> Result<()> {
        self.scheduler.restart_service(label, cancel).await
    }

    /// Stop everything, roots-first (shutdown path)
    pub async fn shutdown(&self) {
        self.scheduler.stop_all(&CancellationToken::new()).await;
    }

    /// Status snapshot of one service
    pub fn status(&self, label: &str) -> Result<ServiceRecord> {
        self.registry
            .get_record(label)
            .ok_or_else(|| Error::NotFound(label.to_string()))
    }

    /// Snapshots of every service
    #[must_use]
    pub fn list(&self) -> Vec<ServiceRecord> {
        self.registry.all()
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.bus.subscribe(EventFilter::all())
    }

    /// Subscribe with a filter
    #[must_use]
    pub fn subscribe_filtered(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Resolve class dependency declarations to instance labels
    ///
    /// A declaration matches, in order: an exact registered label, a
    /// registered instance of that class, a registered instance of that
    /// kind. Several matches pick the lexicographically smallest label.
    fn resolve_dependencies(&self, class: &ServiceClassDef) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        for decl in &class.service_config.dependencies {
            if self.registry.contains(decl) {
                resolved.push(decl.clone());
                continue;
            }
            let candidate = self
                .registry
                .all()
                .into_iter()
                .filter(|r| {
                    r.class_ref.as_deref() == Some(decl.as_str()) || r.kind.as_str() == decl
                })
                .map(|r| r.label)
                .min();
            match candidate {
                Some(label) => resolved.push(label),
                None => {
                    return Err(Error::validation(
                        "dependencies",
                        format!("dependency '{decl}' matches no registered service"),
                    ));
                }
            }
        }
        Ok(resolved)
    }
}

/// Check supplied parameters against the class declarations, applying
/// defaults. Undeclared parameters are rejected.
fn validate_parameters(
    class: &ServiceClassDef,
    given: Map<String, Value>,
) -> Result<Map<String, Value>> {
    let declared = &class.service_config.create_parameters;

    for key in given.keys() {
        if !declared.contains_key(key) {
            return Err(Error::validation(
                key.clone(),
                format!("parameter not declared by class '{}'", class.name),
            ));
        }
    }

    let mut out = Map::new();
    for (name, def) in declared {
        match given.get(name) {
            Some(value) => {
                if !def.param_type.accepts(value) {
                    return Err(Error::validation(
                        name.clone(),
                        format!("expected {:?} value", def.param_type),
                    ));
                }
                out.insert(name.clone(), value.clone());
            }
            None => {
                if let Some(default) = &def.default {
                    out.insert(name.clone(), default.clone());
                } else if def.required {
                    return Err(Error::validation(name.clone(), "required parameter missing"));
                }
            }
        }
    }
    Ok(out)
}

fn render_default_label(class: &ServiceClassDef, params: &Map<String, Value>) -> Result<String> {
    let Some(template_str) = &class.service_config.default_label else {
        return Err(Error::validation(
            "label",
            format!("class '{}' has no default label template; a label is required", class.name),
        ));
    };
    let ctx = TemplateContext::new("", params, &Value::Null);
    let rendered = template::render(&Value::String(template_str.clone()), &ctx)?;
    match rendered {
        Value::String(label) if !label.trim().is_empty() => Ok(label),
        _ => Err(Error::validation("label", "default label rendered empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ToolInvoker;
    use crate::class::fixtures;
    use crate::lifecycle::testing::MockInvoker;
    use crate::service::ServiceKind;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct Fixture {
        registry: Arc<Registry>,
        classes: Arc<ServiceClassManager>,
        invoker: Arc<MockInvoker>,
        orchestrator: Arc<Orchestrator>,
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
        let scheduler = DependencyScheduler::new(Arc::clone(&registry), Arc::clone(&runner), 8);
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            bus,
            Arc::clone(&classes),
            runner,
            scheduler,
        );
        Fixture {
            registry,
            classes,
            invoker,
            orchestrator,
        }
    }

    fn make_available(classes: &ServiceClassManager, names: &[&str]) {
        let tools: BTreeSet<String> = names
            .iter()
            .flat_map(|n| [format!("{n}_start"), format!("{n}_stop")])
            .collect();
        classes.recompute_availability(&tools);
    }

    fn grafana_class() -> ServiceClassDef {
        let mut class = fixtures::class("grafana");
        class.service_config.default_label = Some("grafana-{{ env }}".to_string());
        class.service_config.create_parameters.insert(
            "env".to_string(),
            crate::class::ParameterDef {
                param_type: crate::class::ParamType::String,
                required: true,
                default: None,
                description: String::new(),
            },
        );
        class.service_config.create_parameters.insert(
            "replicas".to_string(),
            crate::class::ParameterDef {
                param_type: crate::class::ParamType::Integer,
                required: false,
                default: Some(json!(1)),
                description: String::new(),
            },
        );
        class
    }

    #[test]
    fn create_registers_stopped_with_frozen_params() {
        let f = fixture();
        f.classes.create(grafana_class()).unwrap();
        make_available(&f.classes, &["grafana"]);

        let record = f
            .orchestrator
            .create_service("grafana", None, json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap();

        assert_eq!(record.label, "grafana-dev");
        assert_eq!(record.state, ServiceState::Stopped);
        assert_eq!(record.creation_parameters["env"], "dev");
        // Default applied.
        assert_eq!(record.creation_parameters["replicas"], 1);
        // No tool calls on create.
        assert!(f.invoker.calls.lock().is_empty());
    }

    #[test]
    fn create_fails_when_class_unavailable() {
        let f = fixture();
        f.classes.create(grafana_class()).unwrap();

        let err = f
            .orchestrator
            .create_service("grafana", None, json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap_err();
        assert!(matches!(err, Error::ClassUnavailable { .. }));
    }

    #[test]
    fn parameter_validation() {
        let f = fixture();
        f.classes.create(grafana_class()).unwrap();
        make_available(&f.classes, &["grafana"]);

        // Missing required.
        let err = f
            .orchestrator
            .create_service("grafana", Some("g".into()), Map::new())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "env"));

        // Wrong type.
        let err = f
            .orchestrator
            .create_service(
                "grafana",
                Some("g".into()),
                json!({"env": 7}).as_object().unwrap().clone(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "env"));

        // Undeclared parameter.
        let err = f
            .orchestrator
            .create_service(
                "grafana",
                Some("g".into()),
                json!({"env": "dev", "bogus": true}).as_object().unwrap().clone(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "bogus"));
    }

    #[test]
    fn class_dependencies_resolve_to_labels() {
        let f = fixture();
        // A running kube connection registered out-of-band.
        f.registry
            .register(ServiceRecord::new("kube-dev", ServiceKind::KubeConnection))
            .unwrap();

        let mut class = grafana_class();
        class.service_config.dependencies = vec!["kube-connection".to_string()];
        f.classes.create(class).unwrap();
        make_available(&f.classes, &["grafana"]);

        let record = f
            .orchestrator
            .create_service("grafana", None, json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap();
        assert_eq!(record.dependencies, vec!["kube-dev".to_string()]);
    }

    #[test]
    fn unresolvable_dependency_is_validation_error() {
        let f = fixture();
        let mut class = grafana_class();
        class.service_config.dependencies = vec!["kube-connection".to_string()];
        f.classes.create(class).unwrap();
        make_available(&f.classes, &["grafana"]);

        let err = f
            .orchestrator
            .create_service("grafana", None, json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "dependencies"));
    }

    #[tokio::test]
    async fn delete_requires_stopped_or_failed() {
        let f = fixture();
        f.classes.create(grafana_class()).unwrap();
        make_available(&f.classes, &["grafana"]);
        f.orchestrator
            .create_service("grafana", Some("g".into()), json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap();

        f.orchestrator
            .start_service("g", &CancellationToken::new())
            .await
            .unwrap();
        let err = f.orchestrator.delete_service("g").unwrap_err();
        assert!(matches!(err, Error::ServiceBusy(_)));

        f.orchestrator
            .stop_service("g", &CancellationToken::new())
            .await
            .unwrap();
        f.orchestrator.delete_service("g").unwrap();
        assert!(f.registry.get("g").is_none());
    }

    #[tokio::test]
    async fn remove_service_force_stops() {
        let f = fixture();
        f.classes.create(grafana_class()).unwrap();
        make_available(&f.classes, &["grafana"]);
        f.orchestrator
            .create_service("grafana", Some("g".into()), json!({"env": "dev"}).as_object().unwrap().clone())
            .unwrap();
        f.orchestrator
            .start_service("g", &CancellationToken::new())
            .await
            .unwrap();

        f.orchestrator.remove_service("g").await.unwrap();
        assert!(f.registry.get("g").is_none());
        assert!(f.invoker.call_names().contains(&"grafana_stop".to_string()));
    }

    #[test]
    fn label_without_template_is_required() {
        let f = fixture();
        f.classes.create(fixtures::class("plain")).unwrap();
        make_available(&f.classes, &["plain"]);

        let err = f
            .orchestrator
            .create_service("plain", None, Map::new())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "label"));

        f.orchestrator
            .create_service("plain", Some("p1".into()), Map::new())
            .unwrap();
    }
}
