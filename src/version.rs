//! Control-plane version identity.

/// Human-readable control-plane version, stamped on every replica group
/// as the `version` label. Groups carrying a different label were created
/// by another control-plane build and are replaced rather than updated.
pub fn pretty_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
