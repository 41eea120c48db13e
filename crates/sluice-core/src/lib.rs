//! Core key-value types and traits for the sluice control plane.
//!
//! This crate is the foundation the rest of the workspace stands on:
//!
//! - **Traits**: [`KeyValueStore`] - the keyspace seam the control plane
//!   reconciles against (put/get/delete/scan/watch with revisions).
//! - **Types**: [`WriteCommand`], [`ReadRequest`], [`WatchEvent`], etc.
//! - **Testing**: [`DeterministicKeyValueStore`], an in-memory store used
//!   by unit tests and the standalone binary.
//! - **Retry**: [`Backoff`] and [`retry_notify`], the jittered-backoff
//!   harness wrapped around every long-running loop.

pub mod backoff;
pub mod constants;
pub mod error;
pub mod inmemory;
pub mod kv;
pub mod traits;

pub use backoff::Backoff;
pub use backoff::retry_notify;
pub use error::KeyValueStoreError;
pub use inmemory::DeterministicKeyValueStore;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValueWithRevision;
pub use kv::ReadRequest;
pub use kv::ReadResult;
pub use kv::ScanRequest;
pub use kv::ScanResult;
pub use kv::WatchEvent;
pub use kv::WatchEventKind;
pub use kv::WatchRequest;
pub use kv::WatchStream;
pub use kv::WriteCommand;
pub use kv::WriteRequest;
pub use kv::WriteResult;
pub use kv::validate_write_command;
pub use traits::KeyValueStore;
