//! Distributed coordination built on keyspace CAS operations.
//!
//! Provides the single-writer election primitive the pipeline master
//! stands on:
//!
//! - [`DistributedLock`] - mutual exclusion with fencing tokens and a
//!   TTL lease for crash recovery.
//! - [`LockSession`] - a held lock with automatic lease renewal, exposing
//!   a cancellation token that fires when the lease is lost.
//!
//! ## Example
//!
//! ```ignore
//! let lock = DistributedLock::new(store, "sluice/_master_lock", "node-1", LockConfig::default());
//! let session = lock.hold(&shutdown).await?;
//!
//! // Single-writer critical section; abort when the lease is lost.
//! tokio::select! {
//!     _ = session.token().cancelled() => { /* lost the lease */ }
//!     _ = reconcile() => {}
//! }
//! ```

mod error;
mod lock;
mod types;

pub use error::CoordinationError;
pub use lock::DistributedLock;
pub use lock::LockConfig;
pub use lock::LockGuard;
pub use lock::LockSession;
pub use types::FencingToken;
pub use types::LockEntry;
pub use types::now_unix_ms;
