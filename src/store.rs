//! Transactional pipeline record store.
//!
//! Wraps the keyspace with the two disciplines the control plane relies
//! on: watch-with-previous (edge detection on state and spec-commit
//! identity) and read-modify-write upserts (so a concurrent user PAUSE is
//! never clobbered by an internal RUNNING/STANDBY transition).

use std::collections::HashMap;
use std::sync::Arc;

use sluice_core::{
    KeyValueStore, KeyValueStoreError, ReadRequest, WatchEventKind, WatchRequest, WatchStream,
    WriteCommand, WriteRequest,
};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::pipeline::{PipelineRecord, PipelineState};

/// Errors from pipeline store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The keyspace failed.
    #[snafu(context(false), display("keyspace error: {source}"))]
    Storage { source: KeyValueStoreError },

    /// A stored record could not be decoded.
    #[snafu(display("corrupted pipeline record at '{key}': {source}"))]
    Decode { key: String, source: serde_json::Error },

    /// A record could not be encoded.
    #[snafu(display("pipeline record encoding failed: {source}"))]
    Encode { source: serde_json::Error },
}

/// An observed change to the pipeline keyspace.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A record was written. `prev` carries the record committed by the
    /// previous put on the same key, `None` on first sight (including the
    /// initial snapshot).
    Put {
        name: String,
        record: PipelineRecord,
        prev: Option<PipelineRecord>,
    },
    /// A record was removed.
    Delete { name: String },
}

/// Store for pipeline records under `<prefix>/pipelines/<name>`.
pub struct PipelineStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
}

impl<S: KeyValueStore + ?Sized> Clone for PipelineStore<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), prefix: self.prefix.clone() }
    }
}

impl<S: KeyValueStore + ?Sized> PipelineStore<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    fn keyspace_prefix(&self) -> String {
        format!("{}/pipelines/", self.prefix)
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.keyspace_prefix())
    }

    /// Open a watch over all pipeline records.
    ///
    /// The initial snapshot arrives as puts with empty `prev`; afterwards
    /// every put carries the previously committed record. The underlying
    /// keyspace watch does not deliver previous values, so the watcher
    /// caches the last decoded record per key.
    pub async fn watch_with_prev(&self) -> Result<PipelineWatcher, StoreError> {
        let stream = self.store.watch(WatchRequest::new(self.keyspace_prefix())).await?;
        Ok(PipelineWatcher {
            stream,
            prefix_len: self.keyspace_prefix().len(),
            last_seen: HashMap::new(),
        })
    }

    /// Read a record; `None` when the pipeline does not exist.
    pub async fn get(&self, name: &str) -> Result<Option<PipelineRecord>, StoreError> {
        let key = self.key(name);
        match self.store.read(ReadRequest::new(key.clone())).await {
            Ok(result) => match result.kv {
                Some(kv) => {
                    let record =
                        serde_json::from_str(&kv.value).context(DecodeSnafu { key })?;
                    Ok(Some(record))
                }
                None => Ok(None),
            },
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Unconditionally write a record (external-API surface; the control
    /// plane itself only writes through [`Self::upsert`]).
    pub async fn put(&self, record: &PipelineRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(record).context(EncodeSnafu)?;
        self.store
            .write(WriteRequest {
                command: WriteCommand::Set { key: self.key(&record.name), value },
            })
            .await?;
        Ok(())
    }

    /// Remove a record.
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .write(WriteRequest { command: WriteCommand::Delete { key: self.key(name) } })
            .await?;
        Ok(())
    }

    /// Read-modify-write a record transactionally.
    ///
    /// The mutator runs against a fresh read of the key (or a placeholder
    /// when absent) and the result commits only if the key is unchanged;
    /// on conflict the whole cycle reruns against the new value. This is
    /// what lets the mutator observe a concurrent PAUSE and leave it
    /// intact.
    pub async fn upsert<F>(&self, name: &str, mut mutator: F) -> Result<PipelineRecord, StoreError>
    where
        F: FnMut(&mut PipelineRecord),
    {
        let key = self.key(name);
        loop {
            let current = match self.store.read(ReadRequest::new(key.clone())).await {
                Ok(result) => result.kv.map(|kv| kv.value),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err.into()),
            };

            let mut record = match &current {
                Some(value) => {
                    serde_json::from_str(value).context(DecodeSnafu { key: key.clone() })?
                }
                None => PipelineRecord::placeholder(name),
            };
            mutator(&mut record);

            let value = serde_json::to_string(&record).context(EncodeSnafu)?;
            match self
                .store
                .write(WriteRequest {
                    command: WriteCommand::CompareAndSwap {
                        key: key.clone(),
                        expected: current,
                        new_value: value,
                    },
                })
                .await
            {
                Ok(_) => return Ok(record),
                Err(KeyValueStoreError::CompareAndSwapFailed { .. }) => {
                    debug!(pipeline = name, "upsert conflict, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Mark a pipeline failed with a human-readable reason.
    pub async fn fail_pipeline(&self, name: &str, reason: &str) -> Result<(), StoreError> {
        self.upsert(name, |record| {
            record.state = PipelineState::Failure;
            record.reason = reason.to_string();
        })
        .await?;
        Ok(())
    }
}

/// Stream of [`PipelineEvent`]s with per-key previous values.
pub struct PipelineWatcher {
    stream: WatchStream,
    prefix_len: usize,
    last_seen: HashMap<String, PipelineRecord>,
}

impl PipelineWatcher {
    /// Next event; `None` when the store tears the watch down.
    pub async fn recv(&mut self) -> Option<Result<PipelineEvent, StoreError>> {
        let event = self.stream.recv().await?;
        let name = event.key[self.prefix_len.min(event.key.len())..].to_string();
        match event.kind {
            WatchEventKind::Put => {
                let value = event.value.unwrap_or_default();
                let record: PipelineRecord = match serde_json::from_str(&value)
                    .context(DecodeSnafu { key: event.key.clone() })
                {
                    Ok(record) => record,
                    Err(err) => return Some(Err(err)),
                };
                let prev = self.last_seen.insert(name.clone(), record.clone());
                Some(Ok(PipelineEvent::Put { name, record, prev }))
            }
            WatchEventKind::Delete => {
                self.last_seen.remove(&name);
                Some(Ok(PipelineEvent::Delete { name }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::DeterministicKeyValueStore;

    fn record(name: &str, state: PipelineState) -> PipelineRecord {
        PipelineRecord {
            state,
            version: 1,
            ..PipelineRecord::placeholder(name)
        }
    }

    #[tokio::test]
    async fn watch_attaches_previous_record() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv, "sluice");

        store.put(&record("edges", PipelineState::Starting)).await.unwrap();

        let mut watcher = store.watch_with_prev().await.unwrap();

        // Snapshot entry has no previous value.
        match watcher.recv().await.unwrap().unwrap() {
            PipelineEvent::Put { name, prev, .. } => {
                assert_eq!(name, "edges");
                assert!(prev.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        store.put(&record("edges", PipelineState::Running)).await.unwrap();

        match watcher.recv().await.unwrap().unwrap() {
            PipelineEvent::Put { record, prev, .. } => {
                assert_eq!(record.state, PipelineState::Running);
                assert_eq!(prev.unwrap().state, PipelineState::Starting);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_observes_deletes() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv, "sluice");
        let mut watcher = store.watch_with_prev().await.unwrap();

        store.put(&record("edges", PipelineState::Starting)).await.unwrap();
        store.delete("edges").await.unwrap();
        store.put(&record("edges", PipelineState::Starting)).await.unwrap();

        assert!(matches!(watcher.recv().await.unwrap().unwrap(), PipelineEvent::Put { .. }));
        assert!(matches!(
            watcher.recv().await.unwrap().unwrap(),
            PipelineEvent::Delete { name } if name == "edges"
        ));
        // Re-creation after a delete starts over without a previous value.
        match watcher.recv().await.unwrap().unwrap() {
            PipelineEvent::Put { prev, .. } => assert!(prev.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_preserves_paused() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv, "sluice");

        store.put(&record("edges", PipelineState::Paused)).await.unwrap();

        // The monitor's RUNNING transition must leave PAUSED intact.
        let result = store
            .upsert("edges", |record| {
                if record.state != PipelineState::Paused {
                    record.state = PipelineState::Running;
                }
            })
            .await
            .unwrap();
        assert_eq!(result.state, PipelineState::Paused);
    }

    #[tokio::test]
    async fn upsert_retries_on_conflict() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv.clone(), "sluice");

        store.put(&record("edges", PipelineState::Starting)).await.unwrap();

        // Race two upserts; both must land (second retries over the
        // first's commit rather than clobbering it).
        let store_a = store.clone();
        let store_b = store.clone();
        let (a, b) = tokio::join!(
            store_a.upsert("edges", |r| r.version += 1),
            store_b.upsert("edges", |r| r.cache_size = "1G".to_string()),
        );
        a.unwrap();
        b.unwrap();

        let final_record = store.get("edges").await.unwrap().unwrap();
        assert_eq!(final_record.version, 2);
        assert_eq!(final_record.cache_size, "1G");
    }

    #[tokio::test]
    async fn upsert_creates_placeholder_when_absent() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv, "sluice");

        let record = store
            .upsert("fresh", |record| record.state = PipelineState::Standby)
            .await
            .unwrap();
        assert_eq!(record.name, "fresh");
        assert_eq!(record.state, PipelineState::Standby);
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_pipeline_sets_state_and_reason() {
        let kv = DeterministicKeyValueStore::new();
        let store = PipelineStore::new(kv, "sluice");

        store.put(&record("edges", PipelineState::Running)).await.unwrap();
        store.fail_pipeline("edges", "manifest unknown").await.unwrap();

        let record = store.get("edges").await.unwrap().unwrap();
        assert_eq!(record.state, PipelineState::Failure);
        assert_eq!(record.reason, "manifest unknown");
    }
}
