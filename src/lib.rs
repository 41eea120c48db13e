//! Pipeline-orchestration control plane core.
//!
//! Users declare data-processing pipelines; this crate reconciles the
//! declared pipeline set against the worker replica groups actually
//! present in a container orchestrator, and drives each pipeline through
//! its state machine in response to user control and data-layer signals.
//!
//! The two central pieces:
//!
//! - [`master::Master`] - a singleton reconciler elected via a
//!   distributed lock, consuming the pipeline keyspace watch and the
//!   worker pod watch and issuing replica-group lifecycle commands.
//! - [`monitor`] - one supervised task per active pipeline, subscribing
//!   to output-branch commit readiness and toggling the pipeline between
//!   RUNNING and STANDBY.
//!
//! Everything external sits behind a trait seam: the keyspace
//! ([`sluice_core::KeyValueStore`]), the container orchestrator
//! ([`orchestrator::Orchestrator`]), and the data plane
//! ([`dataplane::DataPlane`]). Deterministic in-memory implementations of
//! all three back the test suite and the standalone binary.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod githook;
pub mod master;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod version;
pub mod workers;

pub use config::MasterConfig;
pub use error::MasterError;
pub use master::Master;
