//! Pipeline data model.
//!
//! The [`PipelineRecord`] is the unit of declared intent: stored in the
//! keyspace under `<prefix>/pipelines/<name>`, watched by the master, and
//! mutated (state field only) by the control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Desired/observed state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Created, workers not yet scaled.
    Starting,
    /// Processing; replicas follow the parallelism spec.
    Running,
    /// Autoscaled to zero while no commits are outstanding.
    Standby,
    /// Halted by the user. Sticky: only the user moves a pipeline out.
    Paused,
    /// Halted by the control plane, with a reason on the record.
    Failure,
}

impl PipelineState {
    /// Stopped pipelines keep no workers in the cluster.
    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Paused | PipelineState::Failure)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Standby => "standby",
            PipelineState::Paused => "paused",
            PipelineState::Failure => "failure",
        };
        write!(f, "{name}")
    }
}

/// Reference to an immutable commit in the data plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Repository (for pipelines, the output repo shares the pipeline name).
    pub repo: String,
    /// Content-addressed commit id.
    pub id: String,
}

/// How many workers a pipeline runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParallelismSpec {
    /// A fixed replica count; 0 is treated as 1.
    Constant(u64),
    /// A multiple of the cluster's node count, rounded, at least 1.
    Coefficient(f64),
}

impl Default for ParallelismSpec {
    fn default() -> Self {
        ParallelismSpec::Constant(1)
    }
}

/// Resource quantities keyed by resource name (`cpu`, `memory`, ...).
pub type ResourceList = BTreeMap<String, String>;

/// The user transform executed by each worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Container image.
    pub image: String,
    /// Command run inside the image.
    pub cmd: Vec<String>,
    /// Extra environment for the user container.
    pub env: BTreeMap<String, String>,
}

/// Descriptor for pipelines exposing a long-lived endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineService {
    /// Port the transform listens on.
    pub internal_port: u16,
    /// Port exposed by the `-user` service.
    pub external_port: u16,
}

/// A node in a pipeline's input tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Input {
    /// A data-plane branch.
    Branch { repo: String, branch: String },
    /// A git ref, delivered through the githook receiver.
    Git { url: String, branch: String },
    /// Cartesian product of child inputs.
    Cross(Vec<Input>),
    /// Union of child inputs.
    Union(Vec<Input>),
}

/// Visit every node of an input tree, parents before children.
pub fn visit_input<F: FnMut(&Input)>(input: &Input, f: &mut F) {
    f(input);
    match input {
        Input::Cross(children) | Input::Union(children) => {
            for child in children {
                visit_input(child, f);
            }
        }
        Input::Branch { .. } | Input::Git { .. } => {}
    }
}

/// True when any node of the tree is a git source.
///
/// A pipeline with a git input requires the githook receiver service to
/// exist before its workers are created.
pub fn has_git_input(input: Option<&Input>) -> bool {
    let mut found = false;
    if let Some(input) = input {
        visit_input(input, &mut |node| {
            if matches!(node, Input::Git { .. }) {
                found = true;
            }
        });
    }
    found
}

/// A declared pipeline, keyed by name in the keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Pipeline name; also the output repo name.
    pub name: String,
    /// Declared version, monotonic per name.
    pub version: u64,
    /// Reference to the immutable specification commit.
    pub spec_commit: Option<Commit>,
    /// Desired state.
    pub state: PipelineState,
    /// Human-readable reason, set when `state` is [`PipelineState::Failure`].
    #[serde(default)]
    pub reason: String,
    /// Branch the pipeline writes output commits to.
    pub output_branch: String,
    /// Worker replica sizing.
    #[serde(default)]
    pub parallelism: ParallelismSpec,
    /// Optional resource requests for the user container.
    #[serde(default)]
    pub resource_requests: Option<ResourceList>,
    /// Optional resource limits for the user container.
    #[serde(default)]
    pub resource_limits: Option<ResourceList>,
    /// The user transform.
    pub transform: Transform,
    /// Cache sizing for the worker sidecar.
    #[serde(default)]
    pub cache_size: String,
    /// Present for pipelines that expose an endpoint.
    #[serde(default)]
    pub service: Option<PipelineService>,
    /// Input tree; `None` for source pipelines.
    #[serde(default)]
    pub input: Option<Input>,
}

impl PipelineRecord {
    /// Placeholder used by STM upserts when the key is absent.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            spec_commit: None,
            state: PipelineState::Starting,
            reason: String::new(),
            output_branch: "master".to_string(),
            parallelism: ParallelismSpec::default(),
            resource_requests: None,
            resource_limits: None,
            transform: Transform::default(),
            cache_size: String::new(),
            service: None,
            input: None,
        }
    }

    /// Name of this pipeline's replica group in the orchestrator.
    pub fn rc_name(&self) -> String {
        rc_name(&self.name, self.version)
    }
}

/// Replica group naming scheme: `pipeline-<name>-v<version>`.
pub fn rc_name(pipeline: &str, version: u64) -> String {
    format!("pipeline-{pipeline}-v{version}")
}
