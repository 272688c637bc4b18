//! Mutating Admission Webhook Logic
//!
//! This module implements defaulting for AppService resources: untagged or
//! non-semver images get a `:latest` tag, and the replica guard from
//! [`super::validation`] is applied so its correction reaches the stored
//! object.

use kube::core::admission::{AdmissionRequest, Operation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};

use super::validation;
use crate::crd::AppService;
use crate::error::Result;

/// Tag appended to images without an acceptable tag
pub const LATEST_TAG: &str = ":latest";

static SEMVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("Invalid semver regex"));

/// Compute the defaulted image for an AppService
///
/// Returns `None` for objects being deleted and when the image already ends
/// in a semver tag.
pub fn default_image(app: &AppService) -> Option<String> {
    if app.metadata.deletion_timestamp.is_some() {
        return None;
    }

    let image = &app.spec.image;
    match image.rfind(':') {
        Some(idx) if SEMVER.is_match(&image[idx + 1..]) => None,
        _ => Some(format!("{image}{LATEST_TAG}")),
    }
}

/// Apply mutations to an AppService admission request
///
/// Returns Some(patch) if mutations were applied, None if no changes needed
pub fn apply_mutations(req: &AdmissionRequest<AppService>) -> Result<Option<serde_json::Value>> {
    let Some(object) = &req.object else {
        return Ok(None);
    };
    if matches!(req.operation, Operation::Delete | Operation::Connect) {
        return Ok(None);
    }

    let mut patches = Vec::new();

    // 1. Tag the image, on creation only: an already-tagged image would be
    // tagged again on every update
    let image = match req.operation {
        Operation::Create => default_image(object),
        _ => None,
    };
    if let Some(image) = image {
        info!("Defaulting image of {} to {}", req.name, image);
        patches.push(json!({
            "op": "add",
            "path": "/spec/image",
            "value": image
        }));
    }

    // 2. Guard the replica count
    let mut guarded = object.clone();
    if validation::validate(&req.operation, &mut guarded) {
        patches.push(json!({
            "op": "add",
            "path": "/spec/replicas",
            "value": guarded.spec.replicas
        }));
    }

    if patches.is_empty() {
        debug!("No mutations needed for {}", req.name);
        Ok(None)
    } else {
        Ok(Some(serde_json::Value::Array(patches)))
    }
}
