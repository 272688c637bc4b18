//! Main reconciler for AppService resources
//!
//! [`Reconciler`] is the state machine turning one AppService into its
//! Deployment and Service. [`run_controller`] wires it into the kube-rs
//! runtime, which calls it once per event with at most one pass in flight
//! per object.
//!
//! A pass runs, in order:
//! 1. fetch the AppService (gone: nothing to do)
//! 2. if it is being deleted, delete both children and drop the finalizer
//! 3. create the children if the Deployment is missing, otherwise rewrite
//!    them when the spec differs from the last-applied snapshot
//! 4. ensure the finalizer
//! 5. persist the snapshot
//!
//! Every step decides from freshly read state, so a pass interrupted at any
//! point is repaired by the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Service, ServiceSpec};
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::finalizers;
use super::resources;
use super::snapshot;
use super::store::{KubeStore, ResourceStore};
use crate::crd::AppService;
use crate::error::{Error, Result};

/// What a reconciliation pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The AppService no longer exists
    Gone,
    /// The AppService was being deleted; children were removed and the finalizer released
    Finalized,
    /// The AppService is being deleted without our finalizer; nothing to clean up
    Skipped,
    /// Deployment and Service were created
    Created,
    /// The spec changed and both children were rewritten
    Updated,
    /// The spec matches the snapshot; children were left alone
    Unchanged,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Gone => "gone",
            ReconcileOutcome::Finalized => "finalized",
            ReconcileOutcome::Skipped => "skipped",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::Unchanged => "unchanged",
        }
    }
}

/// Reconciliation engine for AppService resources
pub struct Reconciler<S: ResourceStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ResourceStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one pass for the AppService `namespace/name`
    ///
    /// Returns the first error encountered; nothing is rolled back.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(app) = self.store.get_app(namespace, name).await? else {
            debug!("AppService {}/{} not found, nothing to do", namespace, name);
            return Ok(ReconcileOutcome::Gone);
        };

        if finalizers::is_being_deleted(&app) {
            return self.cleanup(&app).await;
        }

        let outcome = match self.store.get_deployment(namespace, name).await? {
            None => {
                self.create_children(&app).await?;
                ReconcileOutcome::Created
            }
            Some(deployment) => self.sync_children(&app, deployment).await?,
        };

        let app = finalizers::add_finalizer(&*self.store, &app).await?;
        snapshot::save(&*self.store, &app, &app.spec).await?;

        info!(
            "Reconciled AppService {}/{}: {}",
            namespace,
            name,
            outcome.as_str()
        );
        Ok(outcome)
    }

    /// Delete both children, then release the AppService
    async fn cleanup(&self, app: &AppService) -> Result<ReconcileOutcome> {
        let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
        let name = app.name_any();

        if !finalizers::has_finalizer(app) {
            debug!(
                "AppService {}/{} is being deleted without our finalizer",
                namespace, name
            );
            return Ok(ReconcileOutcome::Skipped);
        }

        info!("Cleaning up AppService: {}/{}", namespace, name);

        if !self.store.delete_deployment(&namespace, &name).await? {
            warn!("Deployment {} not found", name);
        }
        if !self.store.delete_service(&namespace, &name).await? {
            warn!("Service {} not found", name);
        }

        finalizers::remove_finalizer(&*self.store, app).await?;

        info!("Cleanup complete for AppService: {}/{}", namespace, name);
        Ok(ReconcileOutcome::Finalized)
    }

    /// Create Deployment then Service
    async fn create_children(&self, app: &AppService) -> Result<()> {
        self.store
            .create_deployment(&resources::build_deployment(app))
            .await?;
        self.store
            .create_service(&resources::build_service(app))
            .await?;
        Ok(())
    }

    /// Rewrite both children when the spec differs from the snapshot
    ///
    /// A Service missing before any snapshot was recorded means an earlier
    /// create pass stopped between the two children; it is created here.
    /// Once a snapshot exists, a missing Service is reported, never healed.
    async fn sync_children(
        &self,
        app: &AppService,
        mut deployment: Deployment,
    ) -> Result<ReconcileOutcome> {
        let last_applied = snapshot::load(app)?;
        if last_applied == app.spec {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
        let name = app.name_any();
        deployment.spec = resources::build_deployment(app).spec;
        let desired_service = resources::build_service(app);

        let Some(mut service) = self.store.get_service(&namespace, &name).await? else {
            if snapshot::is_recorded(app) {
                return Err(Error::MissingChild {
                    kind: "Service",
                    namespace,
                    name,
                });
            }
            info!(
                "Completing interrupted creation of AppService {}/{}",
                namespace, name
            );
            self.store.update_deployment(&deployment).await?;
            self.store.create_service(&desired_service).await?;
            return Ok(ReconcileOutcome::Created);
        };

        info!("Spec of AppService {}/{} changed, updating children", namespace, name);
        service.spec = Some(carry_allocated_address(
            desired_service.spec.unwrap_or_default(),
            service.spec.as_ref(),
        ));

        self.store.update_deployment(&deployment).await?;
        self.store.update_service(&service).await?;

        Ok(ReconcileOutcome::Updated)
    }
}

/// Copy the platform-allocated cluster address from the live Service spec
fn carry_allocated_address(
    mut desired: ServiceSpec,
    live: Option<&ServiceSpec>,
) -> ServiceSpec {
    desired.cluster_ip = live.and_then(|s| s.cluster_ip.clone());
    desired.cluster_ips = live.and_then(|s| s.cluster_ips.clone());
    desired
}

// ============================================================================
// Controller runtime wiring
// ============================================================================

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub reconciler: Reconciler<KubeStore>,
    /// Requeue interval after a successful pass
    pub resync_interval: Duration,
}

impl ControllerState {
    pub fn new(client: Client, resync_interval: Duration) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::new(KubeStore::new(client.clone()))),
            client,
            resync_interval,
        }
    }
}

/// Main entry point to start the controller
///
/// Watches AppServices in `namespace`, or in all namespaces when `None`,
/// together with the Deployments and Services they own.
pub async fn run_controller(state: Arc<ControllerState>, namespace: Option<String>) -> Result<()> {
    let client = state.client.clone();
    let (apps, deployments, services): (Api<AppService>, Api<Deployment>, Api<Service>) =
        match &namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client.clone()),
            ),
        };

    info!("Starting AppService controller");

    // Verify CRD exists
    match apps.list(&Default::default()).await {
        Ok(_) => info!("AppService CRD is available"),
        Err(e) => {
            error!(
                "AppService CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError("AppService CRD not installed".to_string()));
        }
    }

    Controller::new(apps, Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The function the controller runtime calls for every event
///
/// Called whenever an AppService or one of its children changes, and when
/// the resync timer expires.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<AppService>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&namespace, &name).await;
    observe_duration(started.elapsed());

    let outcome = result?;
    record_outcome(outcome);

    if let Some((reason, message)) = event_for(outcome) {
        if let Err(e) = emit_event(&ctx.client, &obj, "Normal", reason, message).await {
            warn!("Failed to emit event for {}/{}: {:?}", namespace, name, e);
        }
    }

    Ok(next_action(&ctx, outcome))
}

/// Event reason and message for passes that wrote something
pub(crate) fn event_for(outcome: ReconcileOutcome) -> Option<(&'static str, &'static str)> {
    match outcome {
        ReconcileOutcome::Created => Some(("Created", "Created Deployment and Service")),
        ReconcileOutcome::Updated => Some(("Updated", "Updated Deployment and Service to the new spec")),
        ReconcileOutcome::Finalized => Some(("Cleaned", "Deleted Deployment and Service")),
        ReconcileOutcome::Skipped | ReconcileOutcome::Unchanged | ReconcileOutcome::Gone => None,
    }
}

fn next_action(ctx: &ControllerState, outcome: ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::Gone | ReconcileOutcome::Finalized | ReconcileOutcome::Skipped => {
            Action::await_change()
        }
        _ => Action::requeue(ctx.resync_interval),
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(app: Arc<AppService>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", app.name_any(), error);
    record_error(error);

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    app: &AppService,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", app.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: app.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

#[cfg(feature = "metrics")]
fn observe_duration(elapsed: Duration) {
    super::metrics::observe_reconcile_duration_seconds(elapsed.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
fn observe_duration(_elapsed: Duration) {}

#[cfg(feature = "metrics")]
fn record_outcome(outcome: ReconcileOutcome) {
    super::metrics::inc_reconcile_outcome(outcome.as_str());
}

#[cfg(not(feature = "metrics"))]
fn record_outcome(_outcome: ReconcileOutcome) {}

#[cfg(feature = "metrics")]
fn record_error(error: &Error) {
    super::metrics::inc_reconcile_error(error.kind());
}

#[cfg(not(feature = "metrics"))]
fn record_error(_error: &Error) {}
