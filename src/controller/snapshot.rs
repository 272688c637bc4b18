//! Last-applied spec snapshot
//!
//! The spec that last produced the live Deployment and Service is kept as
//! compact JSON in an annotation on the AppService itself. The reconciler
//! compares it with the current spec to decide whether children need to be
//! rewritten.

use kube::ResourceExt;
use tracing::debug;

use super::store::ResourceStore;
use crate::crd::{AppService, AppServiceSpec};
use crate::error::{Error, Result};

/// Annotation holding the last successfully applied spec
pub const SPEC_ANNOTATION: &str = "spec";

/// Serialize a spec into its canonical snapshot form
pub fn encode(spec: &AppServiceSpec) -> Result<String> {
    Ok(serde_json::to_string(spec)?)
}

/// Read the last-applied spec of an AppService
///
/// A missing or empty annotation yields the default spec, which never equals
/// a real one, so a never-reconciled resource is always treated as changed.
/// Unparseable content is an error: the annotation is left as-is and the
/// pass fails until someone fixes or removes it.
pub fn load(app: &AppService) -> Result<AppServiceSpec> {
    let raw = match app.annotations().get(SPEC_ANNOTATION) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(AppServiceSpec::default()),
    };

    serde_json::from_str(raw).map_err(|source| Error::MalformedSnapshot {
        name: app.name_any(),
        source,
    })
}

/// Whether any pass has finished and recorded a snapshot
pub fn is_recorded(app: &AppService) -> bool {
    app.annotations()
        .get(SPEC_ANNOTATION)
        .is_some_and(|raw| !raw.is_empty())
}

/// Record `spec` as the last-applied spec and persist the AppService
///
/// Uses a full update carrying the object's `resourceVersion`, so a
/// concurrent edit surfaces as a conflict instead of being overwritten.
pub async fn save<S>(store: &S, app: &AppService, spec: &AppServiceSpec) -> Result<AppService>
where
    S: ResourceStore + ?Sized,
{
    let encoded = encode(spec)?;

    let mut updated = app.clone();
    updated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_ANNOTATION.to_string(), encoded);

    debug!("Saving spec snapshot for AppService {}", app.name_any());
    store.update_app(&updated).await
}
