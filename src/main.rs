//! Standalone control-plane binary.
//!
//! Wires the master to in-memory backends: a single-process development
//! harness. Production deployments embed [`sluice::Master`] against real
//! keyspace/orchestrator/data-plane clients instead.

use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sluice::config::MasterConfig;
use sluice::dataplane::DeterministicDataPlane;
use sluice::master::Master;
use sluice::orchestrator::DeterministicOrchestrator;
use sluice_core::DeterministicKeyValueStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MasterConfig::load()?;
    tracing::info!(
        namespace = %config.namespace,
        kv_prefix = %config.kv_prefix,
        instance_id = %config.instance_id,
        "starting sluice control plane (standalone backends)"
    );

    let store = DeterministicKeyValueStore::new();
    let orchestrator = DeterministicOrchestrator::new();
    let dataplane = DeterministicDataPlane::new();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let mut master = Master::new(store, orchestrator, dataplane, config, shutdown);
    master.run().await;

    tracing::info!("sluice control plane stopped");
    Ok(())
}
