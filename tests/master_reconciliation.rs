//! End-to-end reconciliation scenarios against the deterministic
//! backends: the master runs as a task while the test plays the roles of
//! the external API (pipeline puts), the data plane (commits), and the
//! orchestrator (pod events).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sluice::config::MasterConfig;
use sluice::dataplane::{DeterministicDataPlane, JobState};
use sluice::master::Master;
use sluice::orchestrator::{
    ContainerStatus, ContainerWaiting, DeterministicOrchestrator, LabelSet, Pod, PodEvent,
    PodEventKind, PodPhase,
};
use sluice::pipeline::{Commit, Input, ParallelismSpec, PipelineRecord, PipelineState, Transform};
use sluice::store::PipelineStore;
use sluice_core::DeterministicKeyValueStore;

const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

struct Cluster {
    orchestrator: Arc<DeterministicOrchestrator>,
    dataplane: Arc<DeterministicDataPlane>,
    pipelines: PipelineStore<DeterministicKeyValueStore>,
    shutdown: CancellationToken,
}

impl Cluster {
    /// Start a master against fresh in-memory backends.
    fn start() -> Self {
        let kv = DeterministicKeyValueStore::new();
        let orchestrator = DeterministicOrchestrator::new();
        let dataplane = DeterministicDataPlane::new();
        let shutdown = CancellationToken::new();

        let config = MasterConfig::default();
        let pipelines = PipelineStore::new(kv.clone(), &config.kv_prefix);

        let mut master =
            Master::new(kv, orchestrator.clone(), dataplane.clone(), config, shutdown.clone());
        tokio::spawn(async move { master.run().await });

        Self { orchestrator, dataplane, pipelines, shutdown }
    }

    fn pipeline(&self, name: &str, version: u64, commit_id: &str) -> PipelineRecord {
        PipelineRecord {
            version,
            spec_commit: Some(Commit { repo: "__spec__".to_string(), id: commit_id.to_string() }),
            state: PipelineState::Starting,
            parallelism: ParallelismSpec::Constant(2),
            transform: Transform {
                image: "example/edges:1".to_string(),
                cmd: vec!["python".to_string(), "edges.py".to_string()],
                env: BTreeMap::new(),
            },
            input: Some(Input::Branch { repo: "images".to_string(), branch: "master".to_string() }),
            ..PipelineRecord::placeholder(name)
        }
    }

    async fn put(&self, record: &PipelineRecord) {
        self.pipelines.put(record).await.unwrap();
    }

    async fn state_of(&self, name: &str) -> Option<PipelineState> {
        self.pipelines.get(name).await.unwrap().map(|r| r.state)
    }

    async fn replicas_of(&self, rc_name: &str) -> Option<u64> {
        self.orchestrator.replica_group(rc_name).await.map(|g| g.spec.replicas)
    }

    async fn wait_for_state(&self, name: &str, state: PipelineState) -> PipelineRecord {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(record) = self.pipelines.get(name).await.unwrap() {
                if record.state == state {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for pipeline {name} to reach {state}"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    async fn wait_for_replicas(&self, rc_name: &str, expected: Option<u64>) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.replicas_of(rc_name).await == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {rc_name} replicas to become {expected:?}"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    async fn wait_for_githook_service(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.orchestrator.service("githook").await.is_some() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for the githook service"
            );
            tokio::time::sleep(POLL).await;
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn failing_worker_pod(pipeline: &str, reason: &str, message: &str) -> Pod {
    Pod {
        name: format!("pipeline-{pipeline}-v1-xyz"),
        phase: PodPhase::Pending,
        message: String::new(),
        labels: LabelSet::from([("component".to_string(), "worker".to_string())]),
        annotations: LabelSet::from([("pipelineName".to_string(), pipeline.to_string())]),
        container_statuses: vec![ContainerStatus {
            name: "user".to_string(),
            waiting: Some(ContainerWaiting {
                reason: reason.to_string(),
                message: message.to_string(),
            }),
        }],
    }
}

#[tokio::test]
async fn create_starts_workers_at_zero_and_registers_monitor() {
    let cluster = Cluster::start();

    cluster.put(&cluster.pipeline("a", 1, "c1")).await;

    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    // The registered monitor sees no commits and parks the pipeline in
    // standby, which is the observable signature of a live monitor.
    cluster.wait_for_state("a", PipelineState::Standby).await;
}

#[tokio::test]
async fn ready_commit_scales_up_and_drained_pipeline_scales_down() {
    let cluster = Cluster::start();

    cluster.put(&cluster.pipeline("a", 1, "c1")).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    cluster.dataplane.publish_commit("a", "master", "out1").await;

    // Monitor: READY commit -> RUNNING; master: RUNNING -> scale up.
    cluster.wait_for_state("a", PipelineState::Running).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(2)).await;

    cluster.dataplane.finish_commit("a", "out1", JobState::Success).await;

    // Monitor: drained -> STANDBY; master: STANDBY -> scale down.
    cluster.wait_for_state("a", PipelineState::Standby).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;
}

#[tokio::test]
async fn pausing_deletes_workers() {
    let cluster = Cluster::start();

    let record = cluster.pipeline("a", 1, "c1");
    cluster.put(&record).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    let mut paused = record.clone();
    paused.state = PipelineState::Paused;
    cluster.put(&paused).await;

    cluster.wait_for_replicas("pipeline-a-v1", None).await;

    // PAUSED is sticky: the cancelled monitor must not move it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.state_of("a").await, Some(PipelineState::Paused));
}

#[tokio::test]
async fn restart_after_pause_recreates_workers() {
    let cluster = Cluster::start();

    let record = cluster.pipeline("a", 1, "c1");
    cluster.put(&record).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    let mut paused = record.clone();
    paused.state = PipelineState::Paused;
    cluster.put(&paused).await;
    cluster.wait_for_replicas("pipeline-a-v1", None).await;

    let mut resumed = record.clone();
    resumed.state = PipelineState::Starting;
    cluster.put(&resumed).await;

    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;
}

#[tokio::test]
async fn image_pull_failure_fails_pipeline_and_deletes_workers() {
    let cluster = Cluster::start();

    cluster.put(&cluster.pipeline("a", 1, "c1")).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    cluster
        .orchestrator
        .push_pod_event(PodEvent {
            kind: PodEventKind::Modified,
            pod: Some(failing_worker_pod("a", "ErrImagePull", "manifest unknown")),
        })
        .await;

    let record = cluster.wait_for_state("a", PipelineState::Failure).await;
    assert_eq!(record.reason, "manifest unknown");

    // The FAILURE put comes back around the watch and deletes workers.
    cluster.wait_for_replicas("pipeline-a-v1", None).await;
}

#[tokio::test]
async fn spec_update_replaces_replica_group() {
    let cluster = Cluster::start();

    cluster.put(&cluster.pipeline("a", 1, "c1")).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    cluster.put(&cluster.pipeline("a", 2, "c2")).await;

    cluster.wait_for_replicas("pipeline-a-v1", None).await;
    cluster.wait_for_replicas("pipeline-a-v2", Some(0)).await;
    assert_eq!(cluster.orchestrator.replica_group_names().await, vec!["pipeline-a-v2"]);
}

#[tokio::test]
async fn same_put_twice_is_idempotent() {
    let cluster = Cluster::start();

    let record = cluster.pipeline("a", 1, "c1");
    cluster.put(&record).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    cluster.put(&record).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(cluster.orchestrator.replica_group_names().await, vec!["pipeline-a-v1"]);
    assert_eq!(cluster.replicas_of("pipeline-a-v1").await, Some(0));
}

#[tokio::test]
async fn git_input_ensures_githook_service() {
    let cluster = Cluster::start();

    let mut record = cluster.pipeline("a", 1, "c1");
    record.input = Some(Input::Cross(vec![
        Input::Branch { repo: "images".to_string(), branch: "master".to_string() },
        Input::Git { url: "https://example.com/app.git".to_string(), branch: "main".to_string() },
    ]));
    cluster.put(&record).await;

    cluster.wait_for_githook_service().await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;
}

#[tokio::test]
async fn persistent_create_failure_marks_pipeline_failed() {
    let cluster = Cluster::start();

    // Enough injected failures to exhaust the bounded create retries.
    cluster.orchestrator.fail_next_creates(3).await;
    cluster.put(&cluster.pipeline("a", 1, "c1")).await;

    let record = cluster.wait_for_state("a", PipelineState::Failure).await;
    assert!(record.reason.starts_with("failed to create workers:"), "reason: {}", record.reason);
}

#[tokio::test]
async fn broken_pod_watch_is_rebuilt_in_place() {
    let cluster = Cluster::start();

    cluster.put(&cluster.pipeline("a", 1, "c1")).await;
    cluster.wait_for_replicas("pipeline-a-v1", Some(0)).await;

    // Break the watch, then prove the rebuilt watch still observes
    // image-pull failures. The rebuild races this event, so keep
    // injecting until the failure lands.
    cluster.orchestrator.push_pod_event(PodEvent { kind: PodEventKind::Error, pod: None }).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        cluster
            .orchestrator
            .push_pod_event(PodEvent {
                kind: PodEventKind::Modified,
                pod: Some(failing_worker_pod("a", "InvalidImageName", "bad image ref")),
            })
            .await;
        if cluster.state_of("a").await == Some(PipelineState::Failure) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the rebuilt pod watch to observe the failure"
        );
        tokio::time::sleep(POLL).await;
    }
}

#[tokio::test]
async fn master_reads_existing_pipelines_at_startup() {
    // Records written before the master starts arrive through the watch
    // snapshot and still get reconciled.
    let kv = DeterministicKeyValueStore::new();
    let orchestrator = DeterministicOrchestrator::new();
    let dataplane = DeterministicDataPlane::new();
    let shutdown = CancellationToken::new();
    let config = MasterConfig::default();
    let pipelines = PipelineStore::new(kv.clone(), &config.kv_prefix);

    let record = PipelineRecord {
        version: 1,
        spec_commit: Some(Commit { repo: "__spec__".to_string(), id: "c1".to_string() }),
        state: PipelineState::Starting,
        transform: Transform {
            image: "example/edges:1".to_string(),
            cmd: vec![],
            env: BTreeMap::new(),
        },
        ..PipelineRecord::placeholder("pre-existing")
    };
    pipelines.put(&record).await.unwrap();

    let mut master = Master::new(kv, orchestrator.clone(), dataplane, config, shutdown.clone());
    tokio::spawn(async move { master.run().await });

    let deadline = tokio::time::Instant::now() + WAIT;
    while orchestrator.replica_group("pipeline-pre-existing-v1").await.is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the snapshot to be reconciled"
        );
        tokio::time::sleep(POLL).await;
    }
    shutdown.cancel();
}
