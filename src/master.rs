//! The pipeline master.
//!
//! A singleton reconciler: acquires the master lock, opens the pipeline
//! keyspace watch and the worker pod watch, and loops over their events.
//! Pipeline puts drive worker-group lifecycle and monitor start/stop; pod
//! events drive image-pull failure transitions. Any error aborts the
//! attempt and the backoff schedule restarts it from lock acquisition.

use std::collections::HashMap;
use std::sync::Arc;

use sluice_core::{Backoff, KeyValueStore};
use sluice_coordination::{DistributedLock, LockConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MasterConfig;
use crate::dataplane::{DataPlane, DataPlaneHandle};
use crate::error::{LockLostSnafu, MasterError, WatchClosedSnafu};
use crate::monitor;
use crate::orchestrator::{LabelSet, Orchestrator, PodEvent, PodPhase, PodWatch};
use crate::pipeline::{PipelineRecord, has_git_input};
use crate::store::{PipelineEvent, PipelineStore};
use crate::version;
use crate::workers::{PIPELINE_NAME_ANNOTATION, worker_selector};

/// Keyspace path of the master lock, under the configured prefix.
const MASTER_LOCK_KEY: &str = "_master_lock";

/// Container name of the user transform inside a worker pod.
const USER_CONTAINER: &str = "user";

/// Waiting reasons that mean the worker image can never start.
const IMAGE_PULL_FAILURES: [&str; 2] = ["InvalidImageName", "ErrImagePull"];

/// The singleton pipeline reconciler.
pub struct Master<S: KeyValueStore + ?Sized + 'static> {
    pub(crate) store: Arc<S>,
    pub(crate) pipelines: PipelineStore<S>,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) data: DataPlaneHandle,
    pub(crate) config: MasterConfig,
    /// Cancellation handle per live monitor, keyed by pipeline name.
    /// Touched only from the master's event-loop task.
    pub(crate) monitors: HashMap<String, CancellationToken>,
    pub(crate) shutdown: CancellationToken,
}

impl<S: KeyValueStore + ?Sized + Send + Sync + 'static> Master<S> {
    pub fn new(
        store: Arc<S>,
        orchestrator: Arc<dyn Orchestrator>,
        dataplane: Arc<dyn DataPlane>,
        config: MasterConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let pipelines = PipelineStore::new(store.clone(), &config.kv_prefix);
        let data = DataPlaneHandle::new(dataplane).with_cancel(shutdown.child_token());
        Self { store, pipelines, orchestrator, data, config, monitors: HashMap::new(), shutdown }
    }

    /// Run the master until shutdown. Every error restarts reconciliation
    /// (including lock acquisition) after a backoff delay.
    pub async fn run(&mut self) {
        let mut backoff = Backoff::infinite();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.run_once().await {
                Ok(()) => return,
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        return;
                    }
                    let delay = backoff.next_delay();
                    error!(error = %err, ?delay, "error running the master process, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One reconciliation attempt: acquire the lock, open both watches,
    /// loop. Returns `Ok(())` only on shutdown.
    async fn run_once(&mut self) -> Result<(), MasterError> {
        let lock = DistributedLock::new(
            self.store.clone(),
            format!("{}/{MASTER_LOCK_KEY}", self.config.kv_prefix),
            self.config.instance_id.clone(),
            LockConfig { ttl_ms: self.config.lease_ttl_ms, ..LockConfig::default() },
        );
        let session = lock.hold(&self.shutdown).await?;

        info!(version = version::pretty_version(), "launching pipeline master");

        let mut watcher = self.pipelines.watch_with_prev().await?;

        // The pod watch is allowed to fail open: without it we cannot
        // observe image-pull failures, but refusing to reconcile would
        // also stop pipelines from being created at all.
        let selector = worker_selector();
        let mut pods = match self.orchestrator.watch_pods(&selector).await {
            Ok(watch) => Some(watch),
            Err(err) => {
                error!(error = %err, "failed to watch worker pods");
                None
            }
        };

        loop {
            tokio::select! {
                _ = session.token().cancelled() => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    return LockLostSnafu.fail();
                }
                event = watcher.recv() => {
                    let event = match event {
                        Some(event) => event?,
                        None => return WatchClosedSnafu.fail(),
                    };
                    if let PipelineEvent::Put { name, record, prev } = event {
                        self.handle_pipeline_put(&name, record, prev).await?;
                    }
                }
                event = recv_pod_event(&mut pods) => {
                    self.handle_pod_event(event, &selector, &mut pods).await?;
                }
            }
        }
    }

    /// React to one pipeline record write.
    async fn handle_pipeline_put(
        &mut self,
        name: &str,
        record: PipelineRecord,
        prev: Option<PipelineRecord>,
    ) -> Result<(), MasterError> {
        // Stopped pipelines keep no workers.
        if record.state.is_stopped() {
            info!(pipeline = %name, state = %record.state, "deleting workers for stopped pipeline");
            self.delete_workers(&record).await?;
            return Ok(());
        }

        let has_git = has_git_input(record.input.as_ref());

        // At most one upsert per event, even when the restart edge and
        // the spec-commit edge fire together.
        let mut upserted_workers = false;

        // Restart edge: stopped -> not stopped.
        if prev.as_ref().is_some_and(|p| p.state.is_stopped()) {
            if has_git {
                self.ensure_githook_service().await?;
            }
            info!(pipeline = %name, "creating workers for restarted pipeline");
            if let Err(err) = self.upsert_workers(&record).await {
                self.set_pipeline_failure(name, &format!("failed to create workers: {err}"))
                    .await?;
                return Ok(());
            }
            upserted_workers = true;
        }

        // Spec edge: new pipeline, or the spec commit changed.
        let spec_changed = match &prev {
            None => true,
            Some(prev) => {
                prev.spec_commit.is_none()
                    || prev.spec_commit.as_ref().map(|c| &c.id)
                        != record.spec_commit.as_ref().map(|c| &c.id)
            }
        };
        if spec_changed && !upserted_workers {
            info!(pipeline = %name, "creating workers for new or updated pipeline");
            if let Some(prev) = &prev {
                self.delete_workers(prev).await?;
            }
            if has_git {
                self.ensure_githook_service().await?;
            }
            if let Err(err) = self.upsert_workers(&record).await {
                self.set_pipeline_failure(name, &format!("failed to create workers: {err}"))
                    .await?;
                return Ok(());
            }
        }

        match record.state {
            crate::pipeline::PipelineState::Running => self.scale_up(&record).await?,
            crate::pipeline::PipelineState::Standby => self.scale_down(&record).await?,
            _ => {}
        }
        Ok(())
    }

    /// React to one worker pod event (or to the watch breaking).
    async fn handle_pod_event(
        &mut self,
        event: Option<PodEvent>,
        selector: &LabelSet,
        pods: &mut Option<PodWatch>,
    ) -> Result<(), MasterError> {
        // An error event, an event with no type, or a closed stream all
        // mean the watch is wedged; re-issue it in place. Reconciliation
        // carries on either way.
        let broken = event.as_ref().map(PodEvent::is_broken).unwrap_or(true);
        if broken {
            *pods = match self.orchestrator.watch_pods(selector).await {
                Ok(watch) => Some(watch),
                Err(err) => {
                    error!(error = %err, "failed to watch worker pods");
                    None
                }
            };
        }

        let Some(PodEvent { pod: Some(pod), .. }) = event else {
            return Ok(());
        };

        if pod.phase == PodPhase::Failed {
            error!(pod = %pod.name, message = %pod.message, "worker pod failed");
        }

        for status in &pod.container_statuses {
            if status.name != USER_CONTAINER {
                continue;
            }
            let Some(waiting) = &status.waiting else {
                continue;
            };
            if !IMAGE_PULL_FAILURES.contains(&waiting.reason.as_str()) {
                continue;
            }
            let Some(pipeline) = pod.annotations.get(PIPELINE_NAME_ANNOTATION) else {
                continue;
            };
            info!(
                pipeline = %pipeline,
                reason = %waiting.reason,
                "failing pipeline whose worker image cannot start"
            );
            self.set_pipeline_failure(pipeline, &waiting.message).await?;
        }
        Ok(())
    }

    /// Mark a pipeline failed with a human-readable reason.
    async fn set_pipeline_failure(&self, name: &str, reason: &str) -> Result<(), MasterError> {
        self.pipelines.fail_pipeline(name, reason).await?;
        Ok(())
    }

    /// Start the pipeline's monitor if it is not already running.
    ///
    /// Monitors are scoped to the process, not to one reconciliation
    /// attempt: a master restart re-ensures them instead of respawning.
    pub(crate) fn ensure_monitor(&mut self, record: &PipelineRecord) {
        if self.monitors.contains_key(&record.name) {
            return;
        }
        let token = self.shutdown.child_token();
        self.monitors.insert(record.name.clone(), token.clone());

        let handle = match &self.config.admin_token {
            Some(admin) => self.data.with_cancel(token.clone()).as_admin(admin),
            None => self.data.with_cancel(token.clone()),
        };
        debug!(pipeline = %record.name, "starting pipeline monitor");
        tokio::spawn(monitor::monitor_pipeline(
            handle,
            self.pipelines.clone(),
            record.clone(),
            token,
        ));
    }

    /// Cancel and forget the pipeline's monitor, if any.
    pub(crate) fn stop_monitor(&mut self, name: &str) {
        if let Some(token) = self.monitors.remove(name) {
            debug!(pipeline = %name, "stopping pipeline monitor");
            token.cancel();
        }
    }

    /// Whether a monitor is registered for `name` (test observability).
    pub fn has_monitor(&self, name: &str) -> bool {
        self.monitors.contains_key(name)
    }
}

/// Receive from an optional pod watch; a missing watch never yields.
async fn recv_pod_event(pods: &mut Option<PodWatch>) -> Option<PodEvent> {
    match pods {
        Some(watch) => watch.recv().await,
        None => std::future::pending().await,
    }
}
