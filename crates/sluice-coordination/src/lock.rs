//! Distributed lock with fencing tokens.
//!
//! Provides single-writer election over a keyspace path with:
//! - Monotonically increasing fencing tokens for split-brain prevention
//! - TTL-based automatic expiration for crash recovery
//! - Exponential backoff with jitter to prevent thundering herd
//! - A session mode that renews the lease and cancels a token on loss

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use sluice_core::KeyValueStore;
use sluice_core::KeyValueStoreError;
use sluice_core::ReadRequest;
use sluice_core::WriteCommand;
use sluice_core::WriteRequest;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::CoordinationError;
use crate::error::LockHeldSnafu;
use crate::error::LockLostSnafu;
use crate::error::TimeoutSnafu;
use crate::types::FencingToken;
use crate::types::LockEntry;

use snafu::ensure;

/// Configuration for the distributed lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Time-to-live for the lease in milliseconds.
    pub ttl_ms: u64,
    /// Maximum time to wait for acquisition; 0 waits forever.
    pub acquire_timeout_ms: u64,
    /// Initial backoff for retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff between retries in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15_000,            // 15 seconds
            acquire_timeout_ms: 0,     // wait forever
            initial_backoff_ms: 50,    // 50ms initial
            max_backoff_ms: 1_000,     // 1 second max
        }
    }
}

/// A distributed mutex lock over a keyspace path.
pub struct DistributedLock<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    key: String,
    holder_id: String,
    config: LockConfig,
}

impl<S: KeyValueStore + ?Sized + 'static> DistributedLock<S> {
    /// Create a new lock handle.
    ///
    /// `key` is the well-known lock path; `holder_id` uniquely identifies
    /// this process among contenders.
    pub fn new(
        store: Arc<S>,
        key: impl Into<String>,
        holder_id: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            holder_id: holder_id.into(),
            config,
        }
    }

    /// Acquire the lock, waiting with jittered exponential backoff while
    /// it is held elsewhere.
    pub async fn acquire(&self) -> Result<LockGuard<S>, CoordinationError> {
        let deadline = (self.config.acquire_timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms));
        let mut backoff_ms = self.config.initial_backoff_ms;

        loop {
            match self.try_acquire().await {
                Ok(guard) => return Ok(guard),
                Err(CoordinationError::LockHeld { holder, deadline_ms }) => {
                    if let Some(deadline) = deadline {
                        ensure!(
                            Instant::now() < deadline,
                            TimeoutSnafu {
                                operation: format!("lock acquisition for '{}'", self.key),
                            }
                        );
                    }

                    // rng created per-iteration to avoid holding a
                    // non-Send value across the await
                    let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
                    let sleep_ms = backoff_ms + jitter;

                    debug!(
                        key = %self.key,
                        holder = %holder,
                        deadline_ms,
                        backoff_ms = sleep_ms,
                        "lock held, backing off"
                    );

                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

                    backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
                }
                Err(CoordinationError::CasConflict) => {
                    // Immediate retry on CAS conflict
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire the lock without blocking.
    pub async fn try_acquire(&self) -> Result<LockGuard<S>, CoordinationError> {
        let current = self.read_lock_entry().await?;

        let (expected, new_token) = match current {
            Some(ref entry) if !entry.is_expired() => {
                return LockHeldSnafu {
                    holder: entry.holder_id.clone(),
                    deadline_ms: entry.deadline_ms,
                }
                .fail();
            }
            Some(ref entry) => {
                debug!(
                    key = %self.key,
                    previous_holder = %entry.holder_id,
                    "taking expired lock"
                );
                (Some(serde_json::to_string(entry)?), entry.fencing_token + 1)
            }
            None => (None, 1),
        };

        let new_entry = LockEntry::new(self.holder_id.clone(), new_token, self.config.ttl_ms);
        let new_json = serde_json::to_string(&new_entry)?;
        // Pre-computed so Drop can release without re-serializing.
        let released_json = serde_json::to_string(&new_entry.released())?;

        match self
            .store
            .write(WriteRequest {
                command: WriteCommand::CompareAndSwap {
                    key: self.key.clone(),
                    expected,
                    new_value: new_json.clone(),
                },
            })
            .await
        {
            Ok(_) => {
                debug!(
                    key = %self.key,
                    holder = %self.holder_id,
                    fencing_token = new_token,
                    ttl_ms = self.config.ttl_ms,
                    "lock acquired"
                );
                Ok(LockGuard {
                    store: self.store.clone(),
                    key: self.key.clone(),
                    holder_id: self.holder_id.clone(),
                    fencing_token: FencingToken(new_token),
                    ttl_ms: self.config.ttl_ms,
                    entry_json: new_json,
                    released_json,
                })
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                // Someone else got it or state changed under us.
                if let Some(json) = actual {
                    match serde_json::from_str::<LockEntry>(&json) {
                        Ok(entry) => LockHeldSnafu {
                            holder: entry.holder_id,
                            deadline_ms: entry.deadline_ms,
                        }
                        .fail(),
                        Err(_) => Err(CoordinationError::CasConflict),
                    }
                } else {
                    // Key was deleted between read and CAS
                    Err(CoordinationError::CasConflict)
                }
            }
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }

    /// Acquire the lock and hold it: a renewal task extends the lease,
    /// and the returned session's token is cancelled when the lease is
    /// lost or `parent` is cancelled.
    pub async fn hold(&self, parent: &CancellationToken) -> Result<LockSession, CoordinationError>
    where
        S: Send + Sync,
    {
        let guard = tokio::select! {
            _ = parent.cancelled() => {
                return TimeoutSnafu {
                    operation: format!("lock acquisition for '{}' (cancelled)", self.key),
                }
                .fail();
            }
            guard = self.acquire() => guard?,
        };

        let token = parent.child_token();
        let fencing_token = guard.fencing_token();
        let renew_interval = Duration::from_millis((self.config.ttl_ms / 3).max(1));

        let renewal_token = token.clone();
        tokio::spawn(async move {
            let mut guard = guard;
            loop {
                tokio::select! {
                    _ = renewal_token.cancelled() => break,
                    _ = tokio::time::sleep(renew_interval) => {
                        if let Err(err) = guard.renew().await {
                            warn!(key = %guard.key, error = %err, "lease renewal failed");
                            renewal_token.cancel();
                            break;
                        }
                    }
                }
            }
            // Guard dropped here releases the lock best-effort.
        });

        Ok(LockSession { token, fencing_token })
    }

    /// Read the current lock entry from storage.
    async fn read_lock_entry(&self) -> Result<Option<LockEntry>, CoordinationError> {
        match self.store.read(ReadRequest::new(self.key.clone())).await {
            Ok(result) => {
                let value = result.kv.map(|kv| kv.value).unwrap_or_default();
                let entry: LockEntry =
                    serde_json::from_str(&value).map_err(|_| CoordinationError::CorruptedData {
                        key: self.key.clone(),
                        reason: "invalid JSON".to_string(),
                    })?;
                Ok(Some(entry))
            }
            Err(KeyValueStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }
}

/// RAII guard that releases the lock on drop.
pub struct LockGuard<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    holder_id: String,
    fencing_token: FencingToken,
    ttl_ms: u64,
    entry_json: String,
    /// Pre-computed released entry JSON for use in Drop.
    released_json: String,
}

impl<S: KeyValueStore + ?Sized + 'static> LockGuard<S> {
    /// Get the fencing token for this acquisition.
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Get the lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lease. Must be called before the lease expires.
    ///
    /// Returns an error if the lock was lost (another holder acquired it).
    pub async fn renew(&mut self) -> Result<(), CoordinationError> {
        let renewed = LockEntry::new(self.holder_id.clone(), self.fencing_token.value(), self.ttl_ms);
        let new_json = serde_json::to_string(&renewed)?;

        match self
            .store
            .write(WriteRequest {
                command: WriteCommand::CompareAndSwap {
                    key: self.key.clone(),
                    expected: Some(self.entry_json.clone()),
                    new_value: new_json.clone(),
                },
            })
            .await
        {
            Ok(_) => {
                self.released_json = serde_json::to_string(&renewed.released())?;
                self.entry_json = new_json;
                debug!(
                    key = %self.key,
                    fencing_token = self.fencing_token.value(),
                    "lock renewed"
                );
                Ok(())
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                let current_holder = actual
                    .and_then(|json| serde_json::from_str::<LockEntry>(&json).ok())
                    .map(|entry| entry.holder_id)
                    .unwrap_or_else(|| "none (deleted)".to_string());
                LockLostSnafu {
                    expected_holder: self.holder_id.clone(),
                    current_holder,
                }
                .fail()
            }
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }

    /// Explicitly release the lock.
    pub async fn release(self) -> Result<(), CoordinationError> {
        match self
            .store
            .write(WriteRequest {
                command: WriteCommand::CompareAndSwap {
                    key: self.key.clone(),
                    expected: Some(self.entry_json.clone()),
                    new_value: self.released_json.clone(),
                },
            })
            .await
        {
            Ok(_) => {
                debug!(
                    key = %self.key,
                    fencing_token = self.fencing_token.value(),
                    "lock released"
                );
                Ok(())
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { .. }) => {
                // Already released or taken over; the lease is gone either way.
                warn!(
                    key = %self.key,
                    fencing_token = self.fencing_token.value(),
                    "lock release failed: already released or taken"
                );
                Ok(())
            }
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        // Best-effort release; the lease expires via TTL regardless.
        let store = self.store.clone();
        let key = self.key.clone();
        let expected = self.entry_json.clone();
        let released = self.released_json.clone();
        let token = self.fencing_token.value();

        tokio::spawn(async move {
            let result = store
                .write(WriteRequest {
                    command: WriteCommand::CompareAndSwap {
                        key: key.clone(),
                        expected: Some(expected),
                        new_value: released,
                    },
                })
                .await;

            match result {
                Ok(_) => debug!(key = %key, fencing_token = token, "lock released on drop"),
                Err(e) => {
                    debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)")
                }
            }
        });
    }
}

/// A held lock with background lease renewal.
///
/// The session's token fires when the lease is lost or the parent token
/// is cancelled. Dropping the session cancels the token, which stops the
/// renewal task and releases the lock.
pub struct LockSession {
    token: CancellationToken,
    fencing_token: FencingToken,
}

impl LockSession {
    /// Token tied to the lease; cancelled when the lease is lost.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The fencing token for this leadership term.
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
