//! ServiceClass manager
//!
//! One store, two ingest paths: YAML files scanned from class directories
//! and programmatic create/update/delete. Both feed the same validation
//! pipeline. Loading degrades gracefully: invalid definitions are skipped
//! and reported, valid ones land in the catalog.
//!
//! A class is *available* iff every tool it references exists in the
//! aggregator's current catalog; availability is recomputed whenever the
//! catalog changes.

pub mod definition;
pub mod template;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use definition::{
    HealthCheckPolicy, LifecycleEvent, LifecycleTools, OperationDef, ParamType, ParameterDef,
    RetryPolicy, ServiceClassDef, ServiceConfig, Timeouts, ToolCall,
};

use crate::aggregator::CatalogSnapshot;
use crate::{Error, Result};

/// Change notifications emitted by the manager
#[derive(Debug, Clone)]
pub enum ClassEvent {
    /// A class was registered
    Registered(String),
    /// A class definition was replaced
    Updated(String),
    /// A class was removed
    Unregistered(String),
    /// A class's availability flipped
    AvailabilityChanged {
        /// Class name
        name: String,
        /// New availability
        available: bool,
    },
}

/// Listing entry for `serviceclass_list`
#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    /// Class name
    pub name: String,
    /// Class version
    pub version: String,
    /// Description
    pub description: String,
    /// Whether every required tool is currently in the catalog
    pub available: bool,
    /// Tools currently missing from the catalog
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_tools: Vec<String>,
}

/// Result of loading a class directory
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names of classes loaded successfully
    pub loaded: Vec<String>,
    /// Files skipped, with the reason
    pub errors: Vec<(PathBuf, String)>,
}

struct ClassEntry {
    def: Arc<ServiceClassDef>,
    available: bool,
    missing: Vec<String>,
}

/// Store and availability tracker for ServiceClass definitions
pub struct ServiceClassManager {
    store: RwLock<BTreeMap<String, ClassEntry>>,
    events: broadcast::Sender<ClassEvent>,
}

impl Default for ServiceClassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceClassManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Subscribe to class change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClassEvent> {
        self.events.subscribe()
    }

    /// Register a new class definition
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` on a duplicate name; the first collected
    /// `Validation` error when the definition is invalid.
    pub fn create(&self, def: ServiceClassDef) -> Result<()> {
        if let Err(mut errors) = def.validate() {
            return Err(errors.remove(0));
        }
        let name = def.name.clone();
        {
            let mut store = self.store.write();
            if store.contains_key(&name) {
                return Err(Error::AlreadyRegistered(name));
            }
            let missing: Vec<String> = def.required_tools().into_iter().collect();
            store.insert(
                name.clone(),
                ClassEntry {
                    def: Arc::new(def),
                    // Not yet checked against a catalog; every tool counts
                    // missing until the first recompute.
                    available: false,
                    missing,
                },
            );
        }
        info!(class = %name, "ServiceClass registered");
        let _ = self.events.send(ClassEvent::Registered(name));
        Ok(())
    }

    /// Replace an existing class definition
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name; validation errors as in
    /// [`ServiceClassManager::create`].
    pub fn update(&self, def: ServiceClassDef) -> Result<()> {
        if let Err(mut errors) = def.validate() {
            return Err(errors.remove(0));
        }
        let name = def.name.clone();
        {
            let mut store = self.store.write();
            let entry = store
                .get_mut(&name)
                .ok_or_else(|| Error::NotFound(name.clone()))?;
            entry.missing = def.required_tools().into_iter().collect();
            entry.available = false;
            entry.def = Arc::new(def);
        }
        let _ = self.events.send(ClassEvent::Updated(name));
        Ok(())
    }

    /// Remove a class definition
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name.
    pub fn delete(&self, name: &str) -> Result<()> {
        let removed = self.store.write().remove(name).is_some();
        if !removed {
            return Err(Error::NotFound(name.to_string()));
        }
        let _ = self.events.send(ClassEvent::Unregistered(name.to_string()));
        Ok(())
    }

    /// Look up a class definition
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ServiceClassDef>> {
        self.store.read().get(name).map(|e| Arc::clone(&e.def))
    }

    /// List all classes with availability
    #[must_use]
    pub fn list(&self) -> Vec<ClassSummary> {
        self.store
            .read()
            .values()
            .map(|entry| ClassSummary {
                name: entry.def.name.clone(),
                version: entry.def.version.clone(),
                description: entry.def.description.clone(),
                available: entry.available,
                missing_tools: entry.missing.clone(),
            })
            .collect()
    }

    /// Whether every tool a class references is currently in the catalog
    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        self.store.read().get(name).is_some_and(|e| e.available)
    }

    /// Tools a class is currently missing
    #[must_use]
    pub fn missing_tools(&self, name: &str) -> Vec<String> {
        self.store
            .read()
            .get(name)
            .map(|e| e.missing.clone())
            .unwrap_or_default()
    }

    /// Load every `.yaml`/`.yml` file under a directory
    ///
    /// Invalid files are reported, not fatal.
    pub fn load_dir(&self, dir: &Path) -> LoadReport {
        let mut report = LoadReport::default();

        for entry in WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = entry.path();
            let is_yaml = path.is_file()
                && matches!(
                    path.extension().and_then(|s| s.to_str()),
                    Some("yaml" | "yml")
                );
            if !is_yaml {
                continue;
            }

            match self.load_file(path) {
                Ok(name) => report.loaded.push(name),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping class definition");
                    report.errors.push((path.to_path_buf(), e.to_string()));
                }
            }
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            skipped = report.errors.len(),
            "ServiceClass directory loaded"
        );
        report
    }

    fn load_file(&self, path: &Path) -> Result<String> {
        let raw = std::fs::read_to_string(path)?;
        let def: ServiceClassDef =
            serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        let name = def.name.clone();
        self.create(def)?;
        Ok(name)
    }

    /// Recompute availability of every class against a tool-name set,
    /// emitting [`ClassEvent::AvailabilityChanged`] on each flip
    pub fn recompute_availability(&self, tools: &BTreeSet<String>) {
        let mut flips = Vec::new();
        {
            let mut store = self.store.write();
            for entry in store.values_mut() {
                let missing: Vec<String> = entry
                    .def
                    .required_tools()
                    .into_iter()
                    .filter(|t| !tools.contains(t))
                    .collect();
                let available = missing.is_empty();
                if available != entry.available {
                    flips.push((entry.def.name.clone(), available));
                }
                entry.available = available;
                entry.missing = missing;
            }
        }
        for (name, available) in flips {
            debug!(class = %name, available, "ServiceClass availability changed");
            let _ = self
                .events
                .send(ClassEvent::AvailabilityChanged { name, available });
        }
    }

    /// Follow aggregator catalog changes, recomputing availability on each
    pub fn watch_catalog(
        self: &Arc<Self>,
        mut catalog: watch::Receiver<Arc<CatalogSnapshot>>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        // Seed from the current snapshot before waiting for changes.
        manager.recompute_availability(&catalog.borrow().tool_names());
        tokio::spawn(async move {
            while catalog.changed().await.is_ok() {
                let tools = catalog.borrow_and_update().tool_names();
                manager.recompute_availability(&tools);
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn create_get_delete() {
        let manager = ServiceClassManager::new();
        manager.create(fixtures::class("db")).unwrap();

        assert!(manager.get("db").is_some());
        assert!(matches!(
            manager.create(fixtures::class("db")).unwrap_err(),
            Error::AlreadyRegistered(_)
        ));

        manager.delete("db").unwrap();
        assert!(manager.get("db").is_none());
        assert!(matches!(
            manager.delete("db").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn new_class_is_unavailable_until_recompute() {
        let manager = ServiceClassManager::new();
        manager.create(fixtures::class("db")).unwrap();
        assert!(!manager.is_available("db"));
        assert_eq!(
            manager.missing_tools("db"),
            vec!["db_start".to_string(), "db_stop".to_string()]
        );
    }

    #[test]
    fn availability_flips_with_catalog() {
        let manager = ServiceClassManager::new();
        let mut events = manager.subscribe();
        manager.create(fixtures::class("db")).unwrap();

        let full: BTreeSet<String> =
            ["db_start", "db_stop"].iter().map(ToString::to_string).collect();
        manager.recompute_availability(&full);
        assert!(manager.is_available("db"));

        // Partial catalog flips it back.
        let partial: BTreeSet<String> = ["db_start"].iter().map(ToString::to_string).collect();
        manager.recompute_availability(&partial);
        assert!(!manager.is_available("db"));
        assert_eq!(manager.missing_tools("db"), vec!["db_stop".to_string()]);

        // Registered, AvailabilityChanged(true), AvailabilityChanged(false).
        assert!(matches!(events.try_recv().unwrap(), ClassEvent::Registered(_)));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClassEvent::AvailabilityChanged { available: true, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClassEvent::AvailabilityChanged { available: false, .. }
        ));
    }

    #[test]
    fn recompute_without_change_emits_nothing() {
        let manager = ServiceClassManager::new();
        manager.create(fixtures::class("db")).unwrap();
        let tools: BTreeSet<String> =
            ["db_start", "db_stop"].iter().map(ToString::to_string).collect();
        manager.recompute_availability(&tools);

        let mut events = manager.subscribe();
        manager.recompute_availability(&tools);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn invalid_create_rejected() {
        let manager = ServiceClassManager::new();
        let mut def = fixtures::class("x");
        def.version = String::new();
        assert!(matches!(
            manager.create(def).unwrap_err(),
            Error::Validation { .. }
        ));
    }

    #[test]
    fn load_dir_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();

        let mut good = std::fs::File::create(dir.path().join("good.yaml")).unwrap();
        write!(
            good,
            r"
name: good
version: '1.0'
serviceConfig:
  lifecycleTools:
    start: {{ tool: g_start }}
    stop: {{ tool: g_stop }}
"
        )
        .unwrap();

        let mut bad = std::fs::File::create(dir.path().join("bad.yaml")).unwrap();
        write!(bad, "name: broken\nversion: '1.0'\n").unwrap();

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let manager = ServiceClassManager::new();
        let report = manager.load_dir(dir.path());

        assert_eq!(report.loaded, vec!["good".to_string()]);
        assert_eq!(report.errors.len(), 1);
        assert!(manager.get("good").is_some());
        assert!(manager.get("broken").is_none());
    }

    #[test]
    fn shipped_class_definitions_load() {
        let dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("serviceclasses");
        let manager = ServiceClassManager::new();
        let report = manager.load_dir(&dir);
        assert!(report.errors.is_empty(), "invalid shipped classes: {:?}", report.errors);
        assert!(report.loaded.contains(&"port-forward".to_string()));
        assert!(report.loaded.contains(&"kube-connection".to_string()));

        let pf = manager.get("port-forward").unwrap();
        assert_eq!(
            pf.kind(),
            crate::service::ServiceKind::PortForward
        );
        assert!(pf.required_tools().contains("k8s_port_forward"));
    }

    #[test]
    fn update_resets_availability() {
        let manager = ServiceClassManager::new();
        manager.create(fixtures::class("db")).unwrap();
        let tools: BTreeSet<String> =
            ["db_start", "db_stop"].iter().map(ToString::to_string).collect();
        manager.recompute_availability(&tools);
        assert!(manager.is_available("db"));

        manager.update(fixtures::class("db")).unwrap();
        assert!(!manager.is_available("db"));
    }
}
