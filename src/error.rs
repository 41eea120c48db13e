//! Control-plane error type.

use sluice_coordination::CoordinationError;
use snafu::Snafu;

use crate::dataplane::DataPlaneError;
use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// Errors surfaced by the master loop, the worker driver, and the
/// per-pipeline monitors.
///
/// Any of these aborts the current reconciliation attempt; the backoff
/// harness restarts it from lock acquisition.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MasterError {
    /// The master lease was lost; another process may now be master.
    #[snafu(display("master lease lost"))]
    LockLost,

    /// The pipeline keyspace watch was torn down.
    #[snafu(display("pipeline watch closed"))]
    WatchClosed,

    /// The commit subscription feeding a monitor ended.
    #[snafu(display("commit subscription closed"))]
    SubscribeClosed,

    /// Expected exactly one githook service.
    #[snafu(display("expected 1 githook service but found {found}"))]
    GithookServiceNotFound { found: usize },

    /// Lock machinery failed.
    #[snafu(context(false), display("coordination error: {source}"))]
    Coordination { source: CoordinationError },

    /// Pipeline store failed.
    #[snafu(context(false), display("{source}"))]
    Store { source: StoreError },

    /// Orchestrator call failed.
    #[snafu(context(false), display("{source}"))]
    Orchestrator { source: OrchestratorError },

    /// Data-plane call failed.
    #[snafu(context(false), display("{source}"))]
    DataPlane { source: DataPlaneError },
}
