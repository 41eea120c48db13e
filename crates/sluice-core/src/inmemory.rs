//! In-memory implementation of [`KeyValueStore`] for testing and
//! standalone mode.
//!
//! Deterministic, non-persistent, single-process. Mirrors the behavior of
//! a production keyspace backend (revisions, CAS, prefix watches) without
//! network or disk I/O, which makes it the substrate for unit tests and
//! the single-binary development harness.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::KeyValueStoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::KeyValueWithRevision;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WatchEvent;
use crate::kv::WatchEventKind;
use crate::kv::WatchRequest;
use crate::kv::WatchStream;
use crate::kv::WriteCommand;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;
use crate::kv::validate_write_command;
use crate::traits::KeyValueStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    create_revision: u64,
    mod_revision: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    revision: u64,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn notify(&mut self, event: WatchEvent) {
        // Prune watchers whose receiver side has been dropped.
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, key: String, value: String) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        let entry = match self.entries.get(&key) {
            Some(prev) => Entry {
                value: value.clone(),
                version: prev.version + 1,
                create_revision: prev.create_revision,
                mod_revision: revision,
            },
            None => Entry {
                value: value.clone(),
                version: 1,
                create_revision: revision,
                mod_revision: revision,
            },
        };
        self.entries.insert(key.clone(), entry);
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            key,
            value: Some(value),
            mod_revision: revision,
        });
        revision
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.revision += 1;
        let revision = self.revision;
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: None,
            mod_revision: revision,
        });
        true
    }
}

/// In-memory deterministic implementation of [`KeyValueStore`].
///
/// # Example
///
/// ```ignore
/// let store = DeterministicKeyValueStore::new();
/// store.write(WriteRequest {
///     command: WriteCommand::Set { key: "k".into(), value: "v".into() },
/// }).await?;
/// ```
#[derive(Default)]
pub struct DeterministicKeyValueStore {
    inner: Mutex<Inner>,
}

impl DeterministicKeyValueStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        validate_write_command(&request.command)?;

        let mut inner = self.inner.lock().await;
        match request.command {
            WriteCommand::Set { key, value } => {
                let revision = inner.put(key, value);
                Ok(WriteResult { revision })
            }
            WriteCommand::Delete { key } => {
                inner.remove(&key);
                Ok(WriteResult { revision: inner.revision })
            }
            WriteCommand::CompareAndSwap { key, expected, new_value } => {
                let actual = inner.entries.get(&key).map(|e| e.value.clone());
                if actual != expected {
                    return Err(KeyValueStoreError::CompareAndSwapFailed { key, actual });
                }
                let revision = inner.put(key, new_value);
                Ok(WriteResult { revision })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        let inner = self.inner.lock().await;
        match inner.entries.get(&request.key) {
            Some(entry) => Ok(ReadResult {
                kv: Some(KeyValueWithRevision {
                    key: request.key,
                    value: entry.value.clone(),
                    version: entry.version,
                    create_revision: entry.create_revision,
                    mod_revision: entry.mod_revision,
                }),
            }),
            None => Err(KeyValueStoreError::NotFound { key: request.key }),
        }
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        let mut inner = self.inner.lock().await;
        let deleted = inner.remove(&request.key);
        Ok(DeleteResult { key: request.key, deleted })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        let inner = self.inner.lock().await;
        let limit = request.limit.unwrap_or(crate::constants::MAX_SCAN_RESULTS) as usize;
        let mut entries: Vec<KeyValueWithRevision> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&request.prefix))
            .map(|(key, entry)| KeyValueWithRevision {
                key: key.clone(),
                value: entry.value.clone(),
                version: entry.version,
                create_revision: entry.create_revision,
                mod_revision: entry.mod_revision,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.truncate(limit);
        let count = entries.len() as u32;
        Ok(ScanResult { entries, count })
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot first, in key order, so every watcher starts from a
        // consistent view before live events arrive.
        let mut snapshot: Vec<(&String, &Entry)> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&request.prefix))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(b.0));
        for (key, entry) in snapshot {
            let _ = tx.send(WatchEvent {
                kind: WatchEventKind::Put,
                key: key.clone(),
                value: Some(entry.value.clone()),
                mod_revision: 0,
            });
        }

        inner.watchers.push(Watcher { prefix: request.prefix, tx });
        Ok(WatchStream::new(rx))
    }
}
