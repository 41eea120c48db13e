//! Container-orchestrator seam.
//!
//! The control plane consumes a narrow slice of the orchestrator:
//! replica groups (create/get/update/delete), services (create/delete/
//! list by label), a label-filtered pod watch, and the cluster node
//! count. Everything behind this trait; the typed not-found sentinel is
//! load-bearing (delete paths swallow it, the githook ensurer branches
//! on it).

pub mod inmemory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;

use crate::pipeline::ResourceList;

pub use inmemory::DeterministicOrchestrator;

/// Labels / label selectors.
pub type LabelSet = BTreeMap<String, String>;

/// Errors from orchestrator operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OrchestratorError {
    /// The named object does not exist.
    #[snafu(display("{kind} '{name}' not found"))]
    NotFound {
        /// Object kind (`replica group`, `service`).
        kind: &'static str,
        name: String,
    },

    /// The named object already exists.
    #[snafu(display("{kind} '{name}' already exists"))]
    AlreadyExists { kind: &'static str, name: String },

    /// Any other orchestrator failure.
    #[snafu(display("orchestrator error: {reason}"))]
    Failed { reason: String },
}

impl OrchestratorError {
    /// Returns true for the typed not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound { .. })
    }
}

/// Pod template carried by a replica group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    /// User container image.
    pub image: String,
    /// User container command.
    pub cmd: Vec<String>,
    /// Environment for the user container.
    pub env: BTreeMap<String, String>,
    /// Resource requests for the user container.
    pub resource_requests: Option<ResourceList>,
    /// Resource limits for the user container.
    pub resource_limits: Option<ResourceList>,
    /// Cache sizing for the worker sidecar.
    pub cache_size: String,
}

/// Declarative spec for a replica group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroupSpec {
    pub name: String,
    pub labels: LabelSet,
    pub annotations: LabelSet,
    /// Desired worker count.
    pub replicas: u64,
    pub template: PodTemplate,
}

/// A replica group as observed in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroup {
    pub spec: ReplicaGroupSpec,
}

impl ReplicaGroup {
    /// The `version` label stamped at creation, if any.
    pub fn version_label(&self) -> Option<&str> {
        self.spec.labels.get("version").map(String::as_str)
    }
}

/// Manifest for a cluster service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub labels: LabelSet,
    /// Pods the service routes to.
    pub selector: LabelSet,
    pub port: u16,
    pub target_port: u16,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Waiting state of a container, with the orchestrator's reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerWaiting {
    pub reason: String,
    pub message: String,
}

/// Status of a single container in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub waiting: Option<ContainerWaiting>,
}

/// Observed pod state, reduced to what the master reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub phase: PodPhase,
    /// Status message attached by the orchestrator, if any.
    pub message: String,
    pub labels: LabelSet,
    pub annotations: LabelSet,
    pub container_statuses: Vec<ContainerStatus>,
}

/// Kind of a pod watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
    /// The watch hit an error; the stream must be rebuilt.
    Error,
    /// The watch produced an event with no type. Some orchestrators get
    /// stuck emitting these in a loop, so it is treated like an error.
    Unknown,
}

/// A single event from the pod watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: Option<Pod>,
}

impl PodEvent {
    /// True when the stream should be torn down and re-issued.
    pub fn is_broken(&self) -> bool {
        matches!(self.kind, PodEventKind::Error | PodEventKind::Unknown)
    }
}

/// Receiving side of a pod watch. Dropping it releases the watch.
#[derive(Debug)]
pub struct PodWatch {
    rx: mpsc::UnboundedReceiver<PodEvent>,
}

impl PodWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<PodEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` when the orchestrator closes the stream.
    pub async fn recv(&mut self) -> Option<PodEvent> {
        self.rx.recv().await
    }
}

/// The orchestrator operations the control plane consumes.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch a replica group by name.
    async fn get_replica_group(&self, name: &str) -> Result<ReplicaGroup, OrchestratorError>;

    /// Create a replica group. Succeeds if an identical group exists.
    async fn create_replica_group(&self, spec: ReplicaGroupSpec) -> Result<(), OrchestratorError>;

    /// Replace an existing replica group's spec.
    async fn update_replica_group(&self, group: ReplicaGroup) -> Result<(), OrchestratorError>;

    /// Delete a replica group. With `orphan_dependents` false the
    /// group's pods are removed with it.
    async fn delete_replica_group(
        &self,
        name: &str,
        orphan_dependents: bool,
    ) -> Result<(), OrchestratorError>;

    /// Create a service.
    async fn create_service(&self, manifest: ServiceManifest) -> Result<(), OrchestratorError>;

    /// Delete a service by name.
    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError>;

    /// List services whose labels contain `selector`.
    async fn list_services(&self, selector: &LabelSet) -> Result<Vec<ServiceManifest>, OrchestratorError>;

    /// Watch pods whose labels contain `selector`.
    async fn watch_pods(&self, selector: &LabelSet) -> Result<PodWatch, OrchestratorError>;

    /// Number of schedulable nodes in the cluster.
    async fn node_count(&self) -> Result<u64, OrchestratorError>;
}
