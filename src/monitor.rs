//! Per-pipeline monitor.
//!
//! One supervised task per active pipeline. Subscribes to READY commits
//! on the pipeline's output branch and drives the record between RUNNING
//! (work outstanding) and STANDBY (drained), always through a
//! read-modify-write upsert so a user PAUSE is never overwritten.
//!
//! The standby gate starts armed: a monitor that sees no commits puts its
//! pipeline straight into standby, then disarms until the next commit
//! re-arms it.

use sluice_core::{Backoff, KeyValueStore, retry_notify};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dataplane::{CommitState, DataPlaneHandle};
use crate::error::{MasterError, SubscribeClosedSnafu};
use crate::pipeline::{PipelineRecord, PipelineState};
use crate::store::PipelineStore;

/// Run the monitor until its token is cancelled.
///
/// Errors restart the monitor body under the infinite backoff schedule;
/// cancellation stops the retry cycle at the next attempt boundary.
pub async fn monitor_pipeline<S>(
    handle: DataPlaneHandle,
    pipelines: PipelineStore<S>,
    record: PipelineRecord,
    token: CancellationToken,
) where
    S: KeyValueStore + ?Sized + 'static,
{
    let name = record.name.clone();
    let result = retry_notify(
        Backoff::infinite(),
        || monitor_once(handle.clone(), pipelines.clone(), record.clone()),
        |err, delay| {
            if token.is_cancelled() {
                return Err(err);
            }
            warn!(pipeline = %name, error = %err, ?delay, "error monitoring pipeline, retrying");
            Ok(())
        },
    )
    .await;

    if let Err(err) = result {
        debug!(pipeline = %name, error = %err, "pipeline monitor stopped");
    }
}

/// One pass of the monitor loop; any error aborts the pass.
async fn monitor_once<S>(
    handle: DataPlaneHandle,
    pipelines: PipelineStore<S>,
    record: PipelineRecord,
) -> Result<(), MasterError>
where
    S: KeyValueStore + ?Sized + 'static,
{
    // Background producer: forwards READY commits into ci_rx. It ends on
    // its own when this pass returns and the receiver drops.
    let (ci_tx, mut ci_rx) = mpsc::channel(16);
    let producer_handle = handle.clone();
    let repo = record.name.clone();
    let branch = record.output_branch.clone();
    let producer = tokio::spawn(async move {
        if let Err(err) = producer_handle
            .subscribe_commit(&repo, &branch, None, CommitState::Ready, ci_tx)
            .await
        {
            warn!(repo = %repo, error = %err, "commit subscription ended");
        }
    });

    // Armed gate == closed channel in a select: the standby arm is
    // immediately ready. Disarmed == nil channel: the arm never fires.
    let mut standby_armed = true;

    let result: Result<(), MasterError> = async {
        loop {
            tokio::select! {
                ci = ci_rx.recv() => {
                    let Some(ci) = ci else {
                        return SubscribeClosedSnafu.fail();
                    };
                    if ci.finished {
                        // A finished commit usually means the job is done
                        // too, but there is a gap between commit finish
                        // and job completion; check before skipping.
                        let job = handle
                            .inspect_job_output_commit(&ci.commit.repo, &ci.commit.id, false)
                            .await?;
                        if job.state.is_terminal() {
                            continue;
                        }
                    }

                    pipelines
                        .upsert(&record.name, |p| {
                            if p.state != PipelineState::Paused {
                                p.state = PipelineState::Running;
                            }
                        })
                        .await?;
                    standby_armed = true;

                    // The job may not exist until the commit finishes;
                    // wait for the commit first, then block on the job.
                    handle.block_commit(&ci.commit.repo, &ci.commit.id).await?;
                    handle.inspect_job_output_commit(&ci.commit.repo, &ci.commit.id, true).await?;
                }
                _ = std::future::ready(()), if standby_armed => {
                    pipelines
                        .upsert(&record.name, |p| {
                            if p.state != PipelineState::Paused {
                                p.state = PipelineState::Standby;
                            }
                        })
                        .await?;
                    standby_armed = false;
                }
            }
        }
    }
    .await;

    producer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use sluice_core::DeterministicKeyValueStore;

    use crate::dataplane::{DataPlane, DeterministicDataPlane, JobState};
    use crate::pipeline::PipelineState;

    fn record(name: &str) -> PipelineRecord {
        PipelineRecord {
            version: 1,
            state: PipelineState::Starting,
            ..PipelineRecord::placeholder(name)
        }
    }

    async fn wait_for_state<S>(
        store: &PipelineStore<S>,
        name: &str,
        state: PipelineState,
    ) -> PipelineRecord
    where
        S: KeyValueStore + ?Sized + 'static,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = store.get(name).await.unwrap() {
                if record.state == state {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "pipeline {name} never reached {state}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_monitor(
        plane: Arc<DeterministicDataPlane>,
        pipelines: PipelineStore<DeterministicKeyValueStore>,
        rec: PipelineRecord,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let handle =
            DataPlaneHandle::new(plane as Arc<dyn DataPlane>).with_cancel(token.child_token());
        tokio::spawn(monitor_pipeline(handle, pipelines, rec, token.clone()));
        token
    }

    #[tokio::test]
    async fn idle_monitor_enters_standby() {
        let kv = DeterministicKeyValueStore::new();
        let pipelines = PipelineStore::new(kv, "sluice");
        let plane = DeterministicDataPlane::new();

        let rec = record("edges");
        pipelines.put(&rec).await.unwrap();
        let token = spawn_monitor(plane, pipelines.clone(), rec);

        wait_for_state(&pipelines, "edges", PipelineState::Standby).await;
        token.cancel();
    }

    #[tokio::test]
    async fn ready_commit_drives_running_then_standby() {
        let kv = DeterministicKeyValueStore::new();
        let pipelines = PipelineStore::new(kv, "sluice");
        let plane = DeterministicDataPlane::new();

        let rec = record("edges");
        pipelines.put(&rec).await.unwrap();
        let token = spawn_monitor(plane.clone(), pipelines.clone(), rec);

        plane.publish_commit("edges", "master", "c1").await;
        wait_for_state(&pipelines, "edges", PipelineState::Running).await;

        plane.finish_commit("edges", "c1", JobState::Success).await;
        wait_for_state(&pipelines, "edges", PipelineState::Standby).await;
        token.cancel();
    }

    #[tokio::test]
    async fn paused_pipeline_is_never_transitioned() {
        let kv = DeterministicKeyValueStore::new();
        let pipelines = PipelineStore::new(kv, "sluice");
        let plane = DeterministicDataPlane::new();

        let mut rec = record("edges");
        rec.state = PipelineState::Paused;
        pipelines.put(&rec).await.unwrap();
        let token = spawn_monitor(plane.clone(), pipelines.clone(), rec);

        plane.publish_commit("edges", "master", "c1").await;
        plane.finish_commit("edges", "c1", JobState::Success).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let current = pipelines.get("edges").await.unwrap().unwrap();
        assert_eq!(current.state, PipelineState::Paused);
        token.cancel();
    }

    #[tokio::test]
    async fn terminal_finished_commit_is_skipped() {
        let kv = DeterministicKeyValueStore::new();
        let pipelines = PipelineStore::new(kv, "sluice");
        let plane = DeterministicDataPlane::new();

        // The commit already finished with a terminal job before the
        // monitor came up; it must not drag the pipeline to RUNNING.
        plane.publish_commit("edges", "master", "c1").await;
        plane.finish_commit("edges", "c1", JobState::Success).await;

        let rec = record("edges");
        pipelines.put(&rec).await.unwrap();
        let token = spawn_monitor(plane, pipelines.clone(), rec);

        wait_for_state(&pipelines, "edges", PipelineState::Standby).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = pipelines.get("edges").await.unwrap().unwrap();
        assert_eq!(current.state, PipelineState::Standby);
        token.cancel();
    }
}
