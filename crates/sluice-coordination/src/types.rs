//! Shared types for the lock primitive.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// Current wall-clock time in Unix milliseconds.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lock entry stored in the keyspace.
///
/// Serialized as JSON for human readability and debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockEntry {
    /// Unique identifier of the lock holder.
    pub holder_id: String,
    /// Monotonically increasing token for fencing.
    pub fencing_token: u64,
    /// When the lock was acquired (Unix timestamp milliseconds).
    pub acquired_at_ms: u64,
    /// TTL in milliseconds.
    pub ttl_ms: u64,
    /// Deadline = acquired_at_ms + ttl_ms.
    pub deadline_ms: u64,
}

impl LockEntry {
    /// Create a new lock entry.
    pub fn new(holder_id: String, fencing_token: u64, ttl_ms: u64) -> Self {
        let acquired_at_ms = now_unix_ms();
        Self {
            holder_id,
            fencing_token,
            acquired_at_ms,
            ttl_ms,
            deadline_ms: acquired_at_ms + ttl_ms,
        }
    }

    /// Create a released lock entry (preserves fencing token for history).
    pub fn released(&self) -> Self {
        Self {
            holder_id: String::new(),
            fencing_token: self.fencing_token,
            acquired_at_ms: self.acquired_at_ms,
            ttl_ms: 0,
            deadline_ms: 0, // 0 means released/expired
        }
    }

    /// Check if this lock entry has expired.
    pub fn is_expired(&self) -> bool {
        self.deadline_ms <= now_unix_ms()
    }
}

/// Fencing token returned on successful lock acquisition.
///
/// Each acquisition carries a strictly greater token than any previous
/// holder's, which lets external services reject stale writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl FencingToken {
    /// Get the raw token value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}
