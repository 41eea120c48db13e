//! In-memory implementation of [`DataPlane`] for testing and standalone
//! mode.
//!
//! Commits are injected with [`DeterministicDataPlane::publish_commit`]
//! and finalized with [`DeterministicDataPlane::finish_commit`]; blocked
//! callers wake through a notifier rather than polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};

use super::{CommitInfo, CommitState, DataPlane, DataPlaneError, JobInfo, JobState};
use crate::pipeline::Commit;

struct Subscriber {
    repo: String,
    branch: String,
    tx: mpsc::UnboundedSender<CommitInfo>,
}

#[derive(Default)]
struct Inner {
    /// Commit ids per branch, in publication order.
    branches: HashMap<(String, String), Vec<String>>,
    /// Finalization flag per commit.
    commits: HashMap<(String, String), bool>,
    /// Job behind each output commit.
    jobs: HashMap<(String, String), JobInfo>,
    subscribers: Vec<Subscriber>,
}

/// In-memory deterministic implementation of [`DataPlane`].
#[derive(Default)]
pub struct DeterministicDataPlane {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl DeterministicDataPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a READY commit on `repo@branch`, waking subscribers.
    pub async fn publish_commit(&self, repo: &str, branch: &str, id: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .branches
            .entry((repo.to_string(), branch.to_string()))
            .or_default()
            .push(id.to_string());
        inner.commits.insert((repo.to_string(), id.to_string()), false);

        let info = CommitInfo {
            commit: Commit { repo: repo.to_string(), id: id.to_string() },
            finished: false,
        };
        inner.subscribers.retain(|sub| {
            if sub.repo != repo || sub.branch != branch {
                return true;
            }
            sub.tx.send(info.clone()).is_ok()
        });
        self.changed.notify_waiters();
    }

    /// Finalize a commit and record its job's terminal state, waking
    /// blocked callers.
    pub async fn finish_commit(&self, repo: &str, id: &str, job_state: JobState) {
        let mut inner = self.inner.lock().await;
        inner.commits.insert((repo.to_string(), id.to_string()), true);
        inner.jobs.insert(
            (repo.to_string(), id.to_string()),
            JobInfo { job_id: format!("job-{id}"), state: job_state },
        );
        self.changed.notify_waiters();
    }

    /// Record a non-terminal job for an output commit.
    pub async fn set_job_state(&self, repo: &str, id: &str, state: JobState) {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(
            (repo.to_string(), id.to_string()),
            JobInfo { job_id: format!("job-{id}"), state },
        );
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl DataPlane for DeterministicDataPlane {
    async fn subscribe_commit(
        &self,
        repo: &str,
        branch: &str,
        from: Option<&str>,
        _state: CommitState,
        tx: mpsc::Sender<CommitInfo>,
    ) -> Result<(), DataPlaneError> {
        // Register first, snapshotting the backlog under the same lock so
        // no commit is missed or duplicated across the boundary.
        let mut backlog_rx = {
            let mut inner = self.inner.lock().await;
            let (itx, irx) = mpsc::unbounded_channel();

            let ids = inner
                .branches
                .get(&(repo.to_string(), branch.to_string()))
                .cloned()
                .unwrap_or_default();
            let skip_through = from.map(str::to_string);
            let mut past_from = skip_through.is_none();
            for id in ids {
                if !past_from {
                    if Some(&id) == skip_through.as_ref() {
                        past_from = true;
                    }
                    continue;
                }
                let finished =
                    *inner.commits.get(&(repo.to_string(), id.clone())).unwrap_or(&false);
                let _ = itx.send(CommitInfo {
                    commit: Commit { repo: repo.to_string(), id },
                    finished,
                });
            }

            inner.subscribers.push(Subscriber {
                repo: repo.to_string(),
                branch: branch.to_string(),
                tx: itx,
            });
            irx
        };

        // Forward until the consumer hangs up.
        while let Some(info) = backlog_rx.recv().await {
            if tx.send(info).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn block_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, DataPlaneError> {
        loop {
            // Register for wakeup before checking, so a finish landing
            // between the check and the await is not lost.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                match inner.commits.get(&(repo.to_string(), id.to_string())) {
                    Some(true) => {
                        return Ok(CommitInfo {
                            commit: Commit { repo: repo.to_string(), id: id.to_string() },
                            finished: true,
                        });
                    }
                    Some(false) => {}
                    None => {
                        return Err(DataPlaneError::CommitNotFound {
                            repo: repo.to_string(),
                            id: id.to_string(),
                        });
                    }
                }
            }
            notified.await;
        }
    }

    async fn inspect_job_output_commit(
        &self,
        repo: &str,
        id: &str,
        block: bool,
    ) -> Result<JobInfo, DataPlaneError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                let job = inner.jobs.get(&(repo.to_string(), id.to_string()));
                match job {
                    Some(job) if !block || job.state.is_terminal() => return Ok(job.clone()),
                    Some(_) => {}
                    None if !block => {
                        return Err(DataPlaneError::JobNotFound {
                            repo: repo.to_string(),
                            id: id.to_string(),
                        });
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }
}
