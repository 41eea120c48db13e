//! Fixed resource limits for keyspace operations.

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum value size in bytes.
///
/// Pipeline records are JSON-encoded and stay well under this, but a
/// runaway transform environment should fail loudly rather than wedge the
/// keyspace.
pub const MAX_VALUE_SIZE: u32 = 1024 * 1024;

/// Maximum number of entries returned by a single scan.
pub const MAX_SCAN_RESULTS: u32 = 10_000;
