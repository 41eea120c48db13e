//! Worker-group driver.
//!
//! Derives replica-group options from a pipeline record and drives the
//! orchestrator: create at zero replicas, replace stale-version groups,
//! cascade deletes, and scale between zero and the parallelism spec.

use std::collections::BTreeMap;
use std::time::Duration;

use sluice_core::{Backoff, KeyValueStore};
use tracing::{error, info, warn};

use crate::config::SUITE;
use crate::error::MasterError;
use crate::master::Master;
use crate::orchestrator::{
    LabelSet, OrchestratorError, PodTemplate, ReplicaGroupSpec, ServiceManifest,
};
use crate::pipeline::{ParallelismSpec, PipelineRecord};
use crate::version;

/// Port the worker sidecar serves datums on.
pub const WORKER_PORT: u16 = 1080;

/// Env var carrying the owning pipeline's name into the user container.
pub const PIPELINE_NAME_ENV: &str = "SLUICE_PIPELINE_NAME";

/// Env var carrying the spec commit id into the user container.
pub const SPEC_COMMIT_ENV: &str = "SLUICE_SPEC_COMMIT";

/// Annotation tying a worker pod back to its pipeline.
pub const PIPELINE_NAME_ANNOTATION: &str = "pipelineName";

/// Attempts before a worker create failure is surfaced to the master.
const CREATE_WORKER_ATTEMPTS: u32 = 3;

/// Label selector matching all worker pods.
pub fn worker_selector() -> LabelSet {
    LabelSet::from([("component".to_string(), "worker".to_string())])
}

/// Everything needed to realize a pipeline's replica group.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub rc_name: String,
    pub labels: LabelSet,
    pub annotations: LabelSet,
    pub replicas: u64,
    pub template: PodTemplate,
    pub service: Option<crate::pipeline::PipelineService>,
}

impl WorkerOptions {
    fn replica_group_spec(&self) -> ReplicaGroupSpec {
        ReplicaGroupSpec {
            name: self.rc_name.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            replicas: self.replicas,
            template: self.template.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Master<S> {
    /// Compute worker-group options for a pipeline record.
    pub(crate) fn worker_options(&self, record: &PipelineRecord) -> WorkerOptions {
        let rc_name = record.rc_name();

        let labels = LabelSet::from([
            ("app".to_string(), rc_name.clone()),
            ("component".to_string(), "worker".to_string()),
            ("suite".to_string(), SUITE.to_string()),
            ("version".to_string(), version::pretty_version().to_string()),
        ]);
        let annotations =
            LabelSet::from([(PIPELINE_NAME_ANNOTATION.to_string(), record.name.clone())]);

        let mut env: BTreeMap<String, String> = record.transform.env.clone();
        env.insert(PIPELINE_NAME_ENV.to_string(), record.name.clone());
        if let Some(commit) = &record.spec_commit {
            env.insert(SPEC_COMMIT_ENV.to_string(), commit.id.clone());
        }

        WorkerOptions {
            rc_name,
            labels,
            annotations,
            // Groups are always created scaled to zero; the state machine
            // scales them up.
            replicas: 0,
            template: PodTemplate {
                image: record.transform.image.clone(),
                cmd: record.transform.cmd.clone(),
                env,
                resource_requests: record.resource_requests.clone(),
                resource_limits: record.resource_limits.clone(),
                cache_size: record.cache_size.clone(),
            },
            service: record.service.clone(),
        }
    }

    /// Create (or replace) the pipeline's replica group and sidecar
    /// services, then make sure its monitor is running.
    ///
    /// Transient orchestrator errors are retried with backoff up to
    /// [`CREATE_WORKER_ATTEMPTS`] times; the final error is surfaced so
    /// the master can mark the pipeline failed.
    pub(crate) async fn upsert_workers(
        &mut self,
        record: &PipelineRecord,
    ) -> Result<(), MasterError> {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0);
        let mut attempts = 0;
        loop {
            match self.try_upsert_workers(record).await {
                Ok(()) => break,
                Err(err) => {
                    attempts += 1;
                    if attempts >= CREATE_WORKER_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    error!(
                        pipeline = %record.name,
                        error = %err,
                        ?delay,
                        "error creating workers, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.ensure_monitor(record);
        Ok(())
    }

    async fn try_upsert_workers(&mut self, record: &PipelineRecord) -> Result<(), MasterError> {
        let rc_name = record.rc_name();

        // A group created by another control-plane build must be replaced
        // rather than updated in place.
        match self.orchestrator.get_replica_group(&rc_name).await {
            Ok(group) => {
                if group.version_label() != Some(version::pretty_version()) {
                    info!(
                        pipeline = %record.name,
                        stale_version = ?group.version_label(),
                        "replacing replica group from previous control-plane version"
                    );
                    self.delete_workers(record).await?;
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(pipeline = %record.name, error = %err, "error fetching replica group");
                self.delete_workers(record).await?;
            }
        }

        let options = self.worker_options(record);
        match self.orchestrator.create_replica_group(options.replica_group_spec()).await {
            Ok(()) | Err(OrchestratorError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let worker_service = ServiceManifest {
            name: rc_name.clone(),
            labels: options.labels.clone(),
            selector: LabelSet::from([("app".to_string(), rc_name.clone())]),
            port: WORKER_PORT,
            target_port: WORKER_PORT,
        };
        match self.orchestrator.create_service(worker_service).await {
            Ok(()) | Err(OrchestratorError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(service) = &options.service {
            let user_service = ServiceManifest {
                name: format!("{rc_name}-user"),
                labels: options.labels.clone(),
                selector: LabelSet::from([("app".to_string(), rc_name.clone())]),
                port: service.external_port,
                target_port: service.internal_port,
            };
            match self.orchestrator.create_service(user_service).await {
                Ok(()) | Err(OrchestratorError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Tear down the pipeline's monitor, services, and replica group.
    ///
    /// Not-found errors are swallowed: deletion is declarative.
    pub(crate) async fn delete_workers(
        &mut self,
        record: &PipelineRecord,
    ) -> Result<(), MasterError> {
        self.stop_monitor(&record.name);

        let rc_name = record.rc_name();
        match self.orchestrator.delete_service(&rc_name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        if record.service.is_some() {
            match self.orchestrator.delete_service(&format!("{rc_name}-user")).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        // orphan_dependents=false cascades to the group's pods.
        match self.orchestrator.delete_replica_group(&rc_name, false).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    /// Scale the replica group to the pipeline's parallelism.
    pub(crate) async fn scale_up(&self, record: &PipelineRecord) -> Result<(), MasterError> {
        let mut group = self.orchestrator.get_replica_group(&record.rc_name()).await?;
        let replicas = match self.expected_workers(&record.parallelism).await {
            Ok(n) => n,
            Err(err) => {
                error!(
                    pipeline = %record.name,
                    error = %err,
                    "error getting number of workers, defaulting to 1 worker"
                );
                1
            }
        };
        group.spec.replicas = replicas;
        self.orchestrator.update_replica_group(group).await?;
        Ok(())
    }

    /// Scale the replica group to zero.
    pub(crate) async fn scale_down(&self, record: &PipelineRecord) -> Result<(), MasterError> {
        let mut group = self.orchestrator.get_replica_group(&record.rc_name()).await?;
        group.spec.replicas = 0;
        self.orchestrator.update_replica_group(group).await?;
        Ok(())
    }

    /// Worker count implied by a parallelism spec and the cluster size.
    async fn expected_workers(&self, spec: &ParallelismSpec) -> Result<u64, MasterError> {
        match spec {
            ParallelismSpec::Constant(0) => Ok(1),
            ParallelismSpec::Constant(n) => Ok(*n),
            ParallelismSpec::Coefficient(c) => {
                let nodes = self.orchestrator.node_count().await?;
                Ok(((c * nodes as f64).round() as u64).max(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sluice_core::DeterministicKeyValueStore;
    use tokio_util::sync::CancellationToken;

    use crate::config::MasterConfig;
    use crate::dataplane::DeterministicDataPlane;
    use crate::orchestrator::{DeterministicOrchestrator, Orchestrator, ReplicaGroup};
    use crate::pipeline::{PipelineService, PipelineState, Transform};

    fn test_master(
        orchestrator: Arc<DeterministicOrchestrator>,
    ) -> Master<DeterministicKeyValueStore> {
        Master::new(
            DeterministicKeyValueStore::new(),
            orchestrator,
            DeterministicDataPlane::new(),
            MasterConfig::default(),
            CancellationToken::new(),
        )
    }

    fn record(name: &str) -> PipelineRecord {
        PipelineRecord {
            version: 1,
            state: PipelineState::Starting,
            spec_commit: Some(crate::pipeline::Commit { repo: "__spec__".into(), id: "c1".into() }),
            transform: Transform {
                image: "example/transform:1".to_string(),
                cmd: vec!["sh".to_string()],
                env: BTreeMap::new(),
            },
            parallelism: ParallelismSpec::Constant(2),
            ..PipelineRecord::placeholder(name)
        }
    }

    #[tokio::test]
    async fn upsert_creates_group_at_zero_replicas() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        master.upsert_workers(&record("edges")).await.unwrap();

        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 0);
        assert_eq!(group.version_label(), Some(version::pretty_version()));
        assert_eq!(
            group.spec.template.env.get(PIPELINE_NAME_ENV).map(String::as_str),
            Some("edges")
        );
        assert!(orchestrator.service("pipeline-edges-v1").await.is_some());
    }

    #[tokio::test]
    async fn upsert_replaces_stale_version_group() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        // A group left behind by an older control-plane build.
        let mut stale = master.worker_options(&record("edges")).replica_group_spec();
        stale.labels.insert("version".to_string(), "0.0.1".to_string());
        stale.replicas = 2;
        orchestrator.create_replica_group(stale).await.unwrap();

        master.upsert_workers(&record("edges")).await.unwrap();

        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.version_label(), Some(version::pretty_version()));
        assert_eq!(group.spec.replicas, 0);
    }

    #[tokio::test]
    async fn upsert_surfaces_error_after_three_attempts() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        orchestrator.fail_next_creates(3).await;
        let err = master.upsert_workers(&record("edges")).await.unwrap_err();
        assert!(err.to_string().contains("injected create failure"));
        assert!(orchestrator.replica_group("pipeline-edges-v1").await.is_none());
    }

    #[tokio::test]
    async fn upsert_retries_past_transient_failures() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        orchestrator.fail_next_creates(2).await;
        master.upsert_workers(&record("edges")).await.unwrap();
        assert!(orchestrator.replica_group("pipeline-edges-v1").await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_group_and_services_and_swallows_not_found() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        let mut rec = record("edges");
        rec.service = Some(PipelineService { internal_port: 8000, external_port: 30080 });
        master.upsert_workers(&rec).await.unwrap();
        assert!(orchestrator.service("pipeline-edges-v1-user").await.is_some());

        master.delete_workers(&rec).await.unwrap();
        assert!(orchestrator.replica_group("pipeline-edges-v1").await.is_none());
        assert!(orchestrator.service("pipeline-edges-v1").await.is_none());
        assert!(orchestrator.service("pipeline-edges-v1-user").await.is_none());

        // Deleting again is a no-op, not an error.
        master.delete_workers(&rec).await.unwrap();
    }

    #[tokio::test]
    async fn scale_up_applies_constant_parallelism() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        let rec = record("edges");
        master.upsert_workers(&rec).await.unwrap();
        master.scale_up(&rec).await.unwrap();

        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 2);

        master.scale_down(&rec).await.unwrap();
        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 0);
    }

    #[tokio::test]
    async fn coefficient_parallelism_scales_with_cluster() {
        let orchestrator = DeterministicOrchestrator::with_nodes(4);
        let mut master = test_master(orchestrator.clone());

        let mut rec = record("edges");
        rec.parallelism = ParallelismSpec::Coefficient(1.5);
        master.upsert_workers(&rec).await.unwrap();
        master.scale_up(&rec).await.unwrap();

        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 6);
    }

    #[tokio::test]
    async fn zero_constant_parallelism_means_one_worker() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        let mut rec = record("edges");
        rec.parallelism = ParallelismSpec::Constant(0);
        master.upsert_workers(&rec).await.unwrap();
        master.scale_up(&rec).await.unwrap();

        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 1);
    }

    #[tokio::test]
    async fn second_upsert_leaves_scaled_group_alone() {
        let orchestrator = DeterministicOrchestrator::new();
        let mut master = test_master(orchestrator.clone());

        let rec = record("edges");
        master.upsert_workers(&rec).await.unwrap();
        master.scale_up(&rec).await.unwrap();

        // Re-upserting the same version must not reset replicas.
        master.upsert_workers(&rec).await.unwrap();
        let group = orchestrator.replica_group("pipeline-edges-v1").await.unwrap();
        assert_eq!(group.spec.replicas, 2);
    }

    #[tokio::test]
    async fn update_missing_group_is_not_found() {
        let orchestrator = DeterministicOrchestrator::new();
        let group = ReplicaGroup {
            spec: ReplicaGroupSpec { name: "pipeline-gone-v1".to_string(), ..Default::default() },
        };
        let err = orchestrator.update_replica_group(group).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
