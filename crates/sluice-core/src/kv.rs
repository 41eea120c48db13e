//! Key-value operation types.
//!
//! Request/result pairs for every [`crate::traits::KeyValueStore`]
//! operation, plus the watch event stream the control plane reconciles
//! from.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::constants::MAX_KEY_SIZE;
use crate::constants::MAX_VALUE_SIZE;
use crate::error::KeyValueStoreError;

/// Commands for modifying keyspace state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a single key-value pair.
    Set { key: String, value: String },
    /// Delete a single key.
    Delete { key: String },
    /// Compare-and-swap: atomically update value if current value matches expected.
    ///
    /// `expected: None` asserts the key does not exist.
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        new_value: String,
    },
}

/// Request wrapper for a write operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

/// Result of a write operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteResult {
    /// Store revision after the write was applied.
    pub revision: u64,
}

/// Key-value pair with revision metadata for optimistic concurrency control.
///
/// The revision fields let clients detect concurrent modifications and
/// implement watch/compare-and-swap patterns over the keyspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Key-specific version number, incremented on each modification.
    ///
    /// Starts at 1 when the key is first created.
    pub version: u64,
    /// Store revision when this key was first created.
    pub create_revision: u64,
    /// Store revision of the most recent modification to this key.
    pub mod_revision: u64,
}

/// Request to read a value by key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a read operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
}

/// Request to delete a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a delete operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub key: String,
    pub deleted: bool,
}

/// Request to scan keys with a given prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub limit: Option<u32>,
}

impl ScanRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), limit: None }
    }
}

/// Response from a scan operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub entries: Vec<KeyValueWithRevision>,
    pub count: u32,
}

/// Request to watch a key prefix for changes.
///
/// The stream opens with a snapshot of all current entries under the
/// prefix (delivered as [`WatchEventKind::Put`]) and continues with
/// incremental events in store order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchRequest {
    pub prefix: String,
}

impl WatchRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

/// Kind of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// The value after the change; `None` on delete.
    pub value: Option<String>,
    /// Store revision that produced this event (0 for snapshot entries
    /// replayed at watch creation).
    pub mod_revision: u64,
}

/// Receiving side of a prefix watch.
///
/// Dropping the stream releases the watch registration in the store.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event; `None` when the store tears the watch down.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Validate a write command against fixed size limits.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    let check_key = |key: &str| {
        if key.is_empty() {
            return Err(KeyValueStoreError::EmptyKey);
        }
        let len = key.len();
        if len > MAX_KEY_SIZE as usize {
            Err(KeyValueStoreError::KeyTooLarge { size: len as u32, max: MAX_KEY_SIZE })
        } else {
            Ok(())
        }
    };

    let check_value = |value: &str| {
        let len = value.len();
        if len > MAX_VALUE_SIZE as usize {
            Err(KeyValueStoreError::ValueTooLarge { size: len as u32, max: MAX_VALUE_SIZE })
        } else {
            Ok(())
        }
    };

    match command {
        WriteCommand::Set { key, value } => {
            check_key(key)?;
            check_value(value)?;
        }
        WriteCommand::Delete { key } => {
            check_key(key)?;
        }
        WriteCommand::CompareAndSwap { key, expected, new_value } => {
            check_key(key)?;
            if let Some(exp) = expected {
                check_value(exp)?;
            }
            check_value(new_value)?;
        }
    }

    Ok(())
}
