//! Error types for keyspace operations.

use snafu::Snafu;

/// Errors from key-value store operations.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// The requested key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A key was empty.
    #[snafu(display("key must not be empty"))]
    EmptyKey,

    /// A key exceeded the size limit.
    #[snafu(display("key size {size} exceeds maximum of {max} bytes"))]
    KeyTooLarge { size: u32, max: u32 },

    /// A value exceeded the size limit.
    #[snafu(display("value size {size} exceeds maximum of {max} bytes"))]
    ValueTooLarge { size: u32, max: u32 },

    /// A compare-and-swap found a different current value.
    ///
    /// `actual` carries the value observed at commit time (`None` when the
    /// key did not exist), so callers can re-derive their next attempt
    /// without another read.
    #[snafu(display("compare-and-swap failed for key '{key}'"))]
    CompareAndSwapFailed {
        /// The contended key.
        key: String,
        /// The value present when the swap was attempted.
        actual: Option<String>,
    },

    /// The watch stream was torn down by the store.
    #[snafu(display("watch stream closed"))]
    WatchClosed,

    /// Any other store failure.
    #[snafu(display("operation failed: {reason}"))]
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

impl KeyValueStoreError {
    /// Returns true for the typed not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyValueStoreError::NotFound { .. })
    }
}
