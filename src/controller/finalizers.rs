//! Finalizer handling for AppService cleanup
//!
//! The finalizer keeps a deleted AppService around until its Deployment and
//! Service have been removed. Both adding and removing it are sent as JSON
//! merge patches computed between a captured copy of the object and the
//! edited copy, pinned to the captured `resourceVersion`: edits to unrelated
//! fields are never overwritten, and a stale copy is rejected with a conflict.

use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::info;

use super::store::ResourceStore;
use crate::crd::AppService;
use crate::error::Result;

/// Finalizer name used to protect AppService resources
pub const APP_SERVICE_FINALIZER: &str = "appservice.batch.appservice.com";

/// Check if the AppService is being deleted
pub fn is_being_deleted(app: &AppService) -> bool {
    app.metadata.deletion_timestamp.is_some()
}

/// Check if the AppService has our finalizer
pub fn has_finalizer(app: &AppService) -> bool {
    app.finalizers().iter().any(|f| f == APP_SERVICE_FINALIZER)
}

/// Add the finalizer if it is not present yet
///
/// Returns the object as persisted, or a clone of `app` when nothing changed.
pub async fn add_finalizer<S>(store: &S, app: &AppService) -> Result<AppService>
where
    S: ResourceStore + ?Sized,
{
    if has_finalizer(app) {
        return Ok(app.clone());
    }

    let mut edited = app.clone();
    edited.finalizers_mut().push(APP_SERVICE_FINALIZER.to_string());

    let patched = patch_from(store, app, &edited).await?;
    info!("Added finalizer to AppService: {}", app.name_any());
    Ok(patched)
}

/// Remove the finalizer after cleanup is complete
///
/// Once the finalizer is gone the API server completes the deletion.
pub async fn remove_finalizer<S>(store: &S, app: &AppService) -> Result<AppService>
where
    S: ResourceStore + ?Sized,
{
    if !has_finalizer(app) {
        return Ok(app.clone());
    }

    let mut edited = app.clone();
    edited
        .finalizers_mut()
        .retain(|f| f != APP_SERVICE_FINALIZER);

    let patched = patch_from(store, app, &edited).await?;
    info!("Removed finalizer from AppService: {}", app.name_any());
    Ok(patched)
}

async fn patch_from<S>(store: &S, original: &AppService, edited: &AppService) -> Result<AppService>
where
    S: ResourceStore + ?Sized,
{
    let patch = merge_patch(original, edited)?;
    let namespace = original
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    store
        .patch_app(&namespace, &original.name_any(), &patch)
        .await
}

/// Compute the merge patch turning `original` into `edited`
///
/// The captured `resourceVersion` is always included as a precondition.
pub fn merge_patch(original: &AppService, edited: &AppService) -> Result<Value> {
    let before = serde_json::to_value(original)?;
    let after = serde_json::to_value(edited)?;

    let mut patch = match merge_diff(&before, &after) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    if let Some(version) = &original.metadata.resource_version {
        let metadata = patch
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".to_string(), Value::String(version.clone()));
        }
    }

    Ok(Value::Object(patch))
}

/// RFC 7386 diff: the smallest merge patch that turns `before` into `after`
///
/// Returns `None` when the two values are equal.
pub(crate) fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(delta) = merge_diff(old_value, new_value) {
                            patch.insert(key.clone(), delta);
                        }
                    }
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (old, new) if old == new => None,
        (_, new) => Some(new.clone()),
    }
}
