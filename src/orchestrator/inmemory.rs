//! In-memory implementation of [`Orchestrator`] for testing and
//! standalone mode.
//!
//! Deterministic and single-process: replica groups and services live in
//! a map, pod events are injected by tests, and targeted failure
//! injection covers the create-retry paths.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{
    LabelSet, Orchestrator, OrchestratorError, PodEvent, PodWatch, ReplicaGroup, ReplicaGroupSpec,
    ServiceManifest,
};

struct PodWatcher {
    selector: LabelSet,
    tx: mpsc::UnboundedSender<PodEvent>,
}

#[derive(Default)]
struct Inner {
    replica_groups: HashMap<String, ReplicaGroup>,
    services: HashMap<String, ServiceManifest>,
    nodes: u64,
    pod_watchers: Vec<PodWatcher>,
    /// Remaining replica-group creates to fail, for retry-path tests.
    failing_creates: u32,
}

fn selector_matches(selector: &LabelSet, labels: &LabelSet) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// In-memory deterministic implementation of [`Orchestrator`].
pub struct DeterministicOrchestrator {
    inner: Mutex<Inner>,
}

impl DeterministicOrchestrator {
    /// Create an empty cluster with a single schedulable node.
    pub fn new() -> Arc<Self> {
        Self::with_nodes(1)
    }

    /// Create an empty cluster with `nodes` schedulable nodes.
    pub fn with_nodes(nodes: u64) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner { nodes, ..Inner::default() }) })
    }

    /// Inject a pod event into every watch whose selector matches the
    /// pod's labels. Events without a pod (watch errors) reach every
    /// watcher.
    pub async fn push_pod_event(&self, event: PodEvent) {
        let mut inner = self.inner.lock().await;
        inner.pod_watchers.retain(|w| {
            let matches = match &event.pod {
                Some(pod) => selector_matches(&w.selector, &pod.labels),
                None => true,
            };
            if !matches {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    /// Fail the next `count` replica-group creates.
    pub async fn fail_next_creates(&self, count: u32) {
        self.inner.lock().await.failing_creates = count;
    }

    /// Test accessor: the current replica group, if any.
    pub async fn replica_group(&self, name: &str) -> Option<ReplicaGroup> {
        self.inner.lock().await.replica_groups.get(name).cloned()
    }

    /// Test accessor: names of all replica groups.
    pub async fn replica_group_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.replica_groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Test accessor: the named service, if any.
    pub async fn service(&self, name: &str) -> Option<ServiceManifest> {
        self.inner.lock().await.services.get(name).cloned()
    }
}

#[async_trait]
impl Orchestrator for DeterministicOrchestrator {
    async fn get_replica_group(&self, name: &str) -> Result<ReplicaGroup, OrchestratorError> {
        let inner = self.inner.lock().await;
        inner.replica_groups.get(name).cloned().ok_or_else(|| OrchestratorError::NotFound {
            kind: "replica group",
            name: name.to_string(),
        })
    }

    async fn create_replica_group(&self, spec: ReplicaGroupSpec) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_creates > 0 {
            inner.failing_creates -= 1;
            return Err(OrchestratorError::Failed {
                reason: "injected create failure".to_string(),
            });
        }
        if let Some(existing) = inner.replica_groups.get(&spec.name) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(OrchestratorError::AlreadyExists {
                kind: "replica group",
                name: spec.name,
            });
        }
        inner.replica_groups.insert(spec.name.clone(), ReplicaGroup { spec });
        Ok(())
    }

    async fn update_replica_group(&self, group: ReplicaGroup) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let name = group.spec.name.clone();
        if !inner.replica_groups.contains_key(&name) {
            return Err(OrchestratorError::NotFound { kind: "replica group", name });
        }
        inner.replica_groups.insert(name, group);
        Ok(())
    }

    async fn delete_replica_group(
        &self,
        name: &str,
        _orphan_dependents: bool,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        if inner.replica_groups.remove(name).is_none() {
            return Err(OrchestratorError::NotFound {
                kind: "replica group",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn create_service(&self, manifest: ServiceManifest) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.services.get(&manifest.name) {
            if *existing == manifest {
                return Ok(());
            }
            return Err(OrchestratorError::AlreadyExists { kind: "service", name: manifest.name });
        }
        inner.services.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        if inner.services.remove(name).is_none() {
            return Err(OrchestratorError::NotFound { kind: "service", name: name.to_string() });
        }
        Ok(())
    }

    async fn list_services(
        &self,
        selector: &LabelSet,
    ) -> Result<Vec<ServiceManifest>, OrchestratorError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<ServiceManifest> = inner
            .services
            .values()
            .filter(|svc| selector_matches(selector, &svc.labels))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }

    async fn watch_pods(&self, selector: &LabelSet) -> Result<PodWatch, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.pod_watchers.push(PodWatcher { selector: selector.clone(), tx });
        Ok(PodWatch::new(rx))
    }

    async fn node_count(&self) -> Result<u64, OrchestratorError> {
        Ok(self.inner.lock().await.nodes)
    }
}
