//! Error types for coordination primitives.

use sluice_core::KeyValueStoreError;
use snafu::Snafu;

/// Errors from distributed lock operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinationError {
    /// The lock is held by another (non-expired) holder.
    #[snafu(display("lock held by '{holder}' until {deadline_ms}"))]
    LockHeld {
        /// Current holder id.
        holder: String,
        /// Unix-millisecond deadline of the holder's lease.
        deadline_ms: u64,
    },

    /// The lock was lost to another holder while we believed we held it.
    #[snafu(display("lock lost: expected holder '{expected_holder}', found '{current_holder}'"))]
    LockLost {
        expected_holder: String,
        current_holder: String,
    },

    /// A compare-and-swap raced with a concurrent writer; retryable.
    #[snafu(display("compare-and-swap conflict"))]
    CasConflict,

    /// Waited too long for an operation.
    #[snafu(display("timed out during {operation}"))]
    Timeout {
        /// Description of what timed out.
        operation: String,
    },

    /// The stored lock entry could not be decoded.
    #[snafu(display("corrupted lock entry at '{key}': {reason}"))]
    CorruptedData { key: String, reason: String },

    /// Failed to encode a lock entry.
    #[snafu(context(false), display("lock entry encoding failed: {source}"))]
    Encoding { source: serde_json::Error },

    /// The underlying keyspace failed.
    #[snafu(display("storage error: {source}"))]
    Storage { source: KeyValueStoreError },
}
