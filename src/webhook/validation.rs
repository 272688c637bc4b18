//! Validating admission logic for AppService resources
//!
//! The guard never rejects an AppService. It only repairs an unusable
//! replica count and reports whether it did.

use kube::core::admission::Operation;
use tracing::info;

use crate::crd::{AppService, AppServiceSpec};

/// Replica count applied when the spec has none or a negative one
pub const DEFAULT_REPLICAS: i32 = 1;

/// Replace an unset or negative replica count with [`DEFAULT_REPLICAS`]
///
/// Returns whether the spec was changed. Zero is a valid request.
pub fn guard_replicas(spec: &mut AppServiceSpec) -> bool {
    match spec.replicas {
        Some(replicas) if replicas >= 0 => false,
        _ => {
            spec.replicas = Some(DEFAULT_REPLICAS);
            true
        }
    }
}

/// Run the guard for an admission operation
///
/// Returns whether `app` was modified.
pub fn validate(operation: &Operation, app: &mut AppService) -> bool {
    match operation {
        Operation::Create | Operation::Update => {
            let changed = guard_replicas(&mut app.spec);
            if changed {
                info!(
                    "Defaulting replicas to {} for AppService {:?}",
                    DEFAULT_REPLICAS, app.metadata.name
                );
            }
            changed
        }
        Operation::Delete | Operation::Connect => false,
    }
}
