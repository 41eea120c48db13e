//! Githook receiver service ensurer.
//!
//! Pipelines with a git input receive pushes through a long-running HTTP
//! receiver (out of scope here). The master only guarantees the service
//! fronting it exists before such a pipeline's workers are created.

use sluice_core::KeyValueStore;

use crate::config::SUITE;
use crate::error::{GithookServiceNotFoundSnafu, MasterError};
use crate::master::Master;
use crate::orchestrator::{LabelSet, ServiceManifest};

/// Port the githook receiver listens on.
pub const GITHOOK_PORT: u16 = 999;

/// API version segment of the push route.
pub const GITHOOK_API_VERSION: &str = "v1";

/// Route the receiver serves push payloads on.
pub fn githook_push_route() -> String {
    format!("/{GITHOOK_API_VERSION}/handle/gitpush")
}

/// Labels identifying the githook service.
pub fn githook_labels() -> LabelSet {
    LabelSet::from([
        ("app".to_string(), "githook".to_string()),
        ("suite".to_string(), SUITE.to_string()),
    ])
}

/// Manifest for the githook service.
pub fn githook_service() -> ServiceManifest {
    ServiceManifest {
        name: "githook".to_string(),
        labels: githook_labels(),
        selector: LabelSet::from([("app".to_string(), "githook".to_string())]),
        port: GITHOOK_PORT,
        target_port: GITHOOK_PORT,
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Master<S> {
    /// Idempotent check-or-create of the githook service.
    pub(crate) async fn ensure_githook_service(&self) -> Result<(), MasterError> {
        match self.get_githook_service().await {
            Ok(_) => Ok(()),
            Err(MasterError::GithookServiceNotFound { .. }) => {
                self.orchestrator.create_service(githook_service()).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_githook_service(&self) -> Result<ServiceManifest, MasterError> {
        let mut services = self.orchestrator.list_services(&githook_labels()).await?;
        let found = services.len();
        if found == 1 {
            if let Some(service) = services.pop() {
                return Ok(service);
            }
        }
        GithookServiceNotFoundSnafu { found }.fail()
    }
}
