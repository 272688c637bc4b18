//! Controller module for AppService reconciliation
//! This module contains the controller loop, the reconciliation state
//! machine and the builders for the child Deployment and Service.

#[cfg(test)]
pub(crate) mod fake_store;
pub mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod resources;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub(crate) use fake_store::test_app;
pub use finalizers::APP_SERVICE_FINALIZER;
pub use reconciler::{run_controller, ControllerState, ReconcileOutcome, Reconciler};
pub use snapshot::SPEC_ANNOTATION;
pub use store::{KubeStore, ResourceStore};
