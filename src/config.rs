//! Control-plane configuration.
//!
//! Environment variables with sensible defaults; values that fail to
//! parse produce a typed error naming the offending variable.

use snafu::Snafu;
use uuid::Uuid;

/// Deployment suite label stamped on every object this control plane
/// owns.
pub const SUITE: &str = "sluice";

/// Errors from configuration loading.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// An environment variable held an unusable value.
    #[snafu(display("invalid value '{value}' for {key}: {reason}"))]
    InvalidValue { key: String, value: String, reason: String },
}

/// Configuration for the pipeline master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Orchestrator namespace the control plane manages.
    pub namespace: String,
    /// Keyspace prefix for all control-plane keys.
    pub kv_prefix: String,
    /// Unique identity of this process, used as the lock holder id.
    pub instance_id: String,
    /// TTL of the master lease in milliseconds.
    pub lease_ttl_ms: u64,
    /// Auth token for cluster-admin data-plane calls, if the deployment
    /// runs with auth enabled.
    pub admin_token: Option<String>,
}

impl MasterConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let namespace =
            std::env::var("SLUICE_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let kv_prefix = std::env::var("SLUICE_KV_PREFIX").unwrap_or_else(|_| "sluice".to_string());
        let instance_id = std::env::var("SLUICE_INSTANCE_ID")
            .unwrap_or_else(|_| format!("master-{}", Uuid::new_v4()));

        let lease_raw =
            std::env::var("SLUICE_MASTER_LEASE_MS").unwrap_or_else(|_| "15000".to_string());
        let lease_ttl_ms = lease_raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: "SLUICE_MASTER_LEASE_MS".to_string(),
            value: lease_raw.clone(),
            reason: format!("must be a duration in milliseconds: {e}"),
        })?;

        let admin_token = std::env::var("SLUICE_ADMIN_TOKEN").ok();

        Ok(Self { namespace, kv_prefix, instance_id, lease_ttl_ms, admin_token })
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kv_prefix: "sluice".to_string(),
            instance_id: format!("master-{}", Uuid::new_v4()),
            lease_ttl_ms: 15_000,
            admin_token: None,
        }
    }
}
