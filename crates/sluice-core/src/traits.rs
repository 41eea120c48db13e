//! The keyspace trait the control plane is built against.

use async_trait::async_trait;

use crate::error::KeyValueStoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WatchRequest;
use crate::kv::WatchStream;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;

/// Distributed key-value store interface.
///
/// Provides linearizable read/write access plus prefix watches. The
/// control plane keeps all shared state behind this seam: pipeline
/// records, the master lock, nothing else.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command to the store.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a value by key with revision metadata.
    ///
    /// Returns the typed [`KeyValueStoreError::NotFound`] sentinel when
    /// the key is absent.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Delete a key from the store.
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError>;

    /// Scan keys matching a prefix.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;

    /// Watch a prefix: current entries replayed as puts, then live events
    /// in store order.
    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        (**self).delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        (**self).watch(request).await
    }
}
