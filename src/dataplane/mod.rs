//! Data-plane client seam.
//!
//! The control plane consumes three operations from the data layer:
//! subscribing to output-branch commits, blocking on commit completion,
//! and inspecting the job behind an output commit. The
//! [`DataPlaneHandle`] wrapper threads a cancellation scope and an auth
//! token through every call, so tearing down a monitor aborts its
//! in-flight subscribe and block calls.

pub mod inmemory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Commit;

pub use inmemory::DeterministicDataPlane;

/// Errors from data-plane operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DataPlaneError {
    /// The enclosing scope was cancelled.
    #[snafu(display("data-plane call cancelled"))]
    Cancelled,

    /// The referenced commit does not exist.
    #[snafu(display("commit {repo}@{id} not found"))]
    CommitNotFound { repo: String, id: String },

    /// No job exists for the referenced output commit.
    #[snafu(display("no job for output commit {repo}@{id}"))]
    JobNotFound { repo: String, id: String },

    /// Any other data-plane failure.
    #[snafu(display("data-plane error: {reason}"))]
    Failed { reason: String },
}

/// Commit states usable as subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    /// Provenance is satisfied; downstream work may begin.
    Ready,
    /// The commit is finalized.
    Finished,
}

/// A commit observed through the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: Commit,
    /// True once the commit has been finalized.
    pub finished: bool,
}

/// State of a transform job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Starting,
    Running,
    Success,
    Failure,
    Killed,
}

impl JobState {
    /// Terminal jobs need no further monitoring.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Killed)
    }
}

/// The job behind an output commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub state: JobState,
}

/// Data-plane operations the control plane consumes.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Stream commits on `repo@branch` matching `state` into `tx`,
    /// starting from `from` (exclusive) or the beginning of the branch.
    /// Runs until the receiving side is dropped or the stream fails.
    async fn subscribe_commit(
        &self,
        repo: &str,
        branch: &str,
        from: Option<&str>,
        state: CommitState,
        tx: mpsc::Sender<CommitInfo>,
    ) -> Result<(), DataPlaneError>;

    /// Wait until the commit is finalized.
    async fn block_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, DataPlaneError>;

    /// Inspect the job that produces `repo@id`. With `block` set, waits
    /// until the job reaches a terminal state.
    async fn inspect_job_output_commit(
        &self,
        repo: &str,
        id: &str,
        block: bool,
    ) -> Result<JobInfo, DataPlaneError>;
}

/// A [`DataPlane`] client scoped to a cancellation token and an auth
/// token.
///
/// Calls race the token, so cancelling the scope aborts blocking
/// operations at their next suspension point. `as_admin` yields the
/// cluster-admin scope the master hands to monitors.
#[derive(Clone)]
pub struct DataPlaneHandle {
    client: Arc<dyn DataPlane>,
    cancel: CancellationToken,
    auth_token: Option<String>,
}

impl DataPlaneHandle {
    pub fn new(client: Arc<dyn DataPlane>) -> Self {
        Self { client, cancel: CancellationToken::new(), auth_token: None }
    }

    /// Rescope this handle to `cancel`.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self { client: self.client.clone(), cancel, auth_token: self.auth_token.clone() }
    }

    /// Rescope this handle to run as cluster admin. All requests made
    /// through the returned handle are privileged; never route
    /// unvalidated user input through it.
    pub fn as_admin(&self, token: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            cancel: self.cancel.clone(),
            auth_token: Some(token.into()),
        }
    }

    /// The cancellation scope of this handle.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn subscribe_commit(
        &self,
        repo: &str,
        branch: &str,
        from: Option<&str>,
        state: CommitState,
        tx: mpsc::Sender<CommitInfo>,
    ) -> Result<(), DataPlaneError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DataPlaneError::Cancelled),
            result = self.client.subscribe_commit(repo, branch, from, state, tx) => result,
        }
    }

    pub async fn block_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, DataPlaneError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DataPlaneError::Cancelled),
            result = self.client.block_commit(repo, id) => result,
        }
    }

    pub async fn inspect_job_output_commit(
        &self,
        repo: &str,
        id: &str,
        block: bool,
    ) -> Result<JobInfo, DataPlaneError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DataPlaneError::Cancelled),
            result = self.client.inspect_job_output_commit(repo, id, block) => result,
        }
    }
}
