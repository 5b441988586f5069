//! Typed in-memory service registry
//!
//! Single reader-writer lock over a label index plus per-kind buckets.
//! Registration rejects duplicate labels and any dependency edge set that
//! would close a cycle with the already-registered graph.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::service::{ServiceKind, ServiceRecord};
use crate::{Error, Result};

/// Shared per-service entry
///
/// The record lock guards the mutable snapshot; the transition lock is held
/// for the full duration of a start/stop/restart and doubles as the guard
/// that keeps health checks from overlapping transitions.
#[derive(Debug)]
pub struct ServiceEntry {
    /// Mutable service record
    pub record: RwLock<ServiceRecord>,
    /// At-most-one-in-flight transition guard
    pub transition: tokio::sync::Mutex<()>,
    /// Cancellation token of the running health loop, if any
    pub health_cancel: Mutex<Option<CancellationToken>>,
}

impl ServiceEntry {
    fn new(record: ServiceRecord) -> Arc<Self> {
        Arc::new(Self {
            record: RwLock::new(record),
            transition: tokio::sync::Mutex::new(()),
            health_cancel: Mutex::new(None),
        })
    }

    /// Label of this service
    #[must_use]
    pub fn label(&self) -> String {
        self.record.read().label.clone()
    }

    /// Snapshot of the current record
    #[must_use]
    pub fn snapshot(&self) -> ServiceRecord {
        self.record.read().clone()
    }

    /// Cancel and clear the health loop token, if present
    pub fn cancel_health_loop(&self) {
        if let Some(token) = self.health_cancel.lock().take() {
            token.cancel();
        }
    }
}

#[derive(Default)]
struct Inner {
    services: HashMap<String, Arc<ServiceEntry>>,
    by_kind: HashMap<ServiceKind, BTreeSet<String>>,
}

/// Typed in-memory store of services keyed by label
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` on a duplicate label; `Validation` when the
    /// service's dependencies close a cycle with the existing graph.
    pub fn register(&self, record: ServiceRecord) -> Result<Arc<ServiceEntry>> {
        let mut inner = self.inner.write();

        if inner.services.contains_key(&record.label) {
            return Err(Error::AlreadyRegistered(record.label));
        }

        if let Some(cycle) = find_cycle(&inner, &record.label, &record.dependencies) {
            return Err(Error::validation(
                "dependencies",
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        let label = record.label.clone();
        let kind = record.kind.clone();
        let entry = ServiceEntry::new(record);

        inner.services.insert(label.clone(), Arc::clone(&entry));
        inner.by_kind.entry(kind).or_default().insert(label);

        Ok(entry)
    }

    /// Remove a service
    ///
    /// # Errors
    ///
    /// `NotFound` when the label is unknown.
    pub fn unregister(&self, label: &str) -> Result<Arc<ServiceEntry>> {
        let mut inner = self.inner.write();

        let entry = inner
            .services
            .remove(label)
            .ok_or_else(|| Error::NotFound(label.to_string()))?;

        let kind = entry.record.read().kind.clone();
        if let Some(bucket) = inner.by_kind.get_mut(&kind) {
            bucket.remove(label);
            if bucket.is_empty() {
                inner.by_kind.remove(&kind);
            }
        }

        Ok(entry)
    }

    /// Look up a service entry by label
    #[must_use]
    pub fn get(&self, label: &str) -> Option<Arc<ServiceEntry>> {
        self.inner.read().services.get(label).cloned()
    }

    /// Look up a service entry, erroring on an unknown label
    pub fn get_required(&self, label: &str) -> Result<Arc<ServiceEntry>> {
        self.get(label).ok_or_else(|| Error::NotFound(label.to_string()))
    }

    /// Record snapshot by label
    #[must_use]
    pub fn get_record(&self, label: &str) -> Option<ServiceRecord> {
        self.get(label).map(|e| e.snapshot())
    }

    /// Whether a label is registered
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.inner.read().services.contains_key(label)
    }

    /// Snapshots of all services, ordered by label
    #[must_use]
    pub fn all(&self) -> Vec<ServiceRecord> {
        let inner = self.inner.read();
        let mut records: Vec<ServiceRecord> =
            inner.services.values().map(|e| e.snapshot()).collect();
        records.sort_by(|a, b| a.label.cmp(&b.label));
        records
    }

    /// Snapshots of all services of one kind, ordered by label
    #[must_use]
    pub fn by_kind(&self, kind: &ServiceKind) -> Vec<ServiceRecord> {
        let inner = self.inner.read();
        inner
            .by_kind
            .get(kind)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|label| inner.services.get(label).map(|e| e.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registered labels, sorted
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.read().services.keys().cloned().collect();
        labels.sort_unstable();
        labels
    }

    /// Direct dependencies of a service (registered ones only)
    #[must_use]
    pub fn dependencies_of(&self, label: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .services
            .get(label)
            .map(|entry| {
                entry
                    .record
                    .read()
                    .dependencies
                    .iter()
                    .filter(|dep| inner.services.contains_key(*dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a service (services that list it as a dependency)
    #[must_use]
    pub fn dependents_of(&self, label: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut dependents: Vec<String> = inner
            .services
            .iter()
            .filter(|(_, entry)| {
                entry
                    .record
                    .read()
                    .dependencies
                    .iter()
                    .any(|dep| dep == label)
            })
            .map(|(l, _)| l.clone())
            .collect();
        dependents.sort_unstable();
        dependents
    }

    /// Touch a record's `updated_at`, applying a mutation under the lock
    pub fn mutate<F, T>(&self, label: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ServiceRecord) -> T,
    {
        let entry = self.get_required(label)?;
        let mut record = entry.record.write();
        let out = f(&mut record);
        record.updated_at = Utc::now();
        Ok(out)
    }
}

/// DFS over the combined edge set (existing graph + the candidate node),
/// returning a cycle path when one exists.
fn find_cycle(inner: &Inner, new_label: &str, new_deps: &[String]) -> Option<Vec<String>> {
    let edges = |label: &str| -> Vec<String> {
        if label == new_label {
            new_deps.to_vec()
        } else {
            inner
                .services
                .get(label)
                .map(|e| e.record.read().dependencies.clone())
                .unwrap_or_default()
        }
    };

    // Only the new node can introduce a cycle; walk from it.
    let mut stack = vec![(edges(new_label), 0usize)];
    let mut path = vec![new_label.to_string()];
    let mut visited = BTreeSet::new();

    loop {
        let next = {
            let Some((deps, idx)) = stack.last_mut() else {
                return None;
            };
            if *idx < deps.len() {
                let next = deps[*idx].clone();
                *idx += 1;
                Some(next)
            } else {
                None
            }
        };

        match next {
            None => {
                stack.pop();
                path.pop();
            }
            Some(next) => {
                if next == new_label {
                    path.push(next);
                    return Some(path);
                }
                // Each registration was checked, so revisits through an
                // already-cleared node cannot hide a cycle.
                if path.contains(&next) || !visited.insert(next.clone()) {
                    continue;
                }
                let next_deps = edges(&next);
                path.push(next);
                stack.push((next_deps, 0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    fn record(label: &str, deps: &[&str]) -> ServiceRecord {
        ServiceRecord::new(label, ServiceKind::Custom("test".into()))
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn register_and_get() {
        let registry = Registry::new();
        registry.register(record("db", &[])).unwrap();

        assert!(registry.contains("db"));
        assert_eq!(registry.get_record("db").unwrap().label, "db");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_label_rejected() {
        let registry = Registry::new();
        registry.register(record("db", &[])).unwrap();

        let err = registry.register(record("db", &[])).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(label) if label == "db"));
    }

    #[test]
    fn unregister_unknown_label() {
        let registry = Registry::new();
        let err = registry.unregister("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(label) if label == "ghost"));
    }

    #[test]
    fn kind_buckets_track_membership() {
        let registry = Registry::new();
        let mcp = ServiceKind::McpServer;
        registry
            .register(ServiceRecord::new("u1", mcp.clone()))
            .unwrap();
        registry
            .register(ServiceRecord::new("u2", mcp.clone()))
            .unwrap();
        registry.register(record("db", &[])).unwrap();

        let servers = registry.by_kind(&mcp);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].label, "u1");

        registry.unregister("u1").unwrap();
        assert_eq!(registry.by_kind(&mcp).len(), 1);
    }

    #[test]
    fn self_dependency_rejected() {
        let registry = Registry::new();
        let err = registry.register(record("a", &["a"])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn dangling_dependency_allowed() {
        let registry = Registry::new();
        // a depends on b before b exists: allowed, the edge is dangling.
        registry.register(record("a", &["b"])).unwrap();
        // b arriving later without a path back to a stays acyclic.
        registry.register(record("c", &[])).unwrap();
        registry.register(record("b", &["c"])).unwrap();
    }

    #[test]
    fn registering_the_closing_edge_is_rejected() {
        let registry = Registry::new();
        registry.register(record("a", &["b"])).unwrap();
        // b depending on a closes a -> b -> a.
        let err = registry.register(record("b", &["a"])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn long_cycle_rejected() {
        let registry = Registry::new();
        registry.register(record("a", &["b"])).unwrap();
        registry.register(record("b", &["c"])).unwrap();
        let err = registry.register(record("c", &["a"])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let registry = Registry::new();
        registry.register(record("d", &[])).unwrap();
        registry.register(record("b", &["d"])).unwrap();
        registry.register(record("c", &["d"])).unwrap();
        registry.register(record("a", &["b", "c"])).unwrap();
    }

    #[test]
    fn dependents_of_reverse_edges() {
        let registry = Registry::new();
        registry.register(record("db", &[])).unwrap();
        registry.register(record("api", &["db"])).unwrap();
        registry.register(record("web", &["api"])).unwrap();

        assert_eq!(registry.dependents_of("db"), vec!["api".to_string()]);
        assert_eq!(registry.dependents_of("api"), vec!["web".to_string()]);
        assert!(registry.dependents_of("web").is_empty());
        assert_eq!(registry.dependencies_of("api"), vec!["db".to_string()]);
    }
}
