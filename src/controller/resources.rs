//! Kubernetes resource builders for AppService
//!
//! Pure functions computing the Deployment and Service an AppService should
//! own. Every field the reconciler later compares or overwrites is populated
//! here, so callers never have to initialize nested maps or selectors.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::AppService;

/// Label key shared by the pod template, the Deployment selector and the Service selector
pub const APP_LABEL: &str = "app";

/// Image pull policy applied to the application container
pub const IMAGE_PULL_POLICY: &str = "IfNotPresent";

/// Exposure mode of the generated Service
pub const SERVICE_TYPE: &str = "NodePort";

/// Labels identifying the pods of an AppService
pub fn app_labels(app: &AppService) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app.name_any())])
}

/// Create the controlling OwnerReference used for garbage collection
pub fn owner_reference(app: &AppService) -> OwnerReference {
    OwnerReference {
        api_version: AppService::api_version(&()).to_string(),
        kind: AppService::kind(&()).to_string(),
        name: app.name_any(),
        uid: app.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn child_metadata(app: &AppService) -> ObjectMeta {
    ObjectMeta {
        name: Some(app.name_any()),
        namespace: app.namespace(),
        owner_references: Some(vec![owner_reference(app)]),
        ..Default::default()
    }
}

// ============================================================================
// Deployment
// ============================================================================

/// Build the Deployment running the application's replicas
pub fn build_deployment(app: &AppService) -> Deployment {
    let labels = app_labels(app);

    Deployment {
        metadata: child_metadata(app),
        spec: Some(DeploymentSpec {
            replicas: app.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![build_container(app)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_container(app: &AppService) -> Container {
    let ports: Vec<ContainerPort> = app.spec.ports.iter().map(container_port).collect();

    Container {
        name: app.name_any(),
        image: Some(app.spec.image.clone()),
        image_pull_policy: Some(IMAGE_PULL_POLICY.to_string()),
        ports: Some(ports),
        resources: app.spec.resources.clone(),
        env: Some(app.spec.envs.clone()),
        ..Default::default()
    }
}

/// The container listens on the service port's numeric target port
///
/// A missing or named target port falls back to the service port, matching
/// how the API server defaults `targetPort` on a Service.
fn container_port(port: &ServicePort) -> ContainerPort {
    let container_port = match &port.target_port {
        Some(IntOrString::Int(target)) => *target,
        _ => port.port,
    };

    ContainerPort {
        container_port,
        ..Default::default()
    }
}

// ============================================================================
// Service
// ============================================================================

/// Build the Service fronting the application's pods
///
/// `clusterIP` is left unset; the platform allocates it on creation.
pub fn build_service(app: &AppService) -> Service {
    Service {
        metadata: child_metadata(app),
        spec: Some(ServiceSpec {
            type_: Some(SERVICE_TYPE.to_string()),
            ports: Some(app.spec.ports.clone()),
            selector: Some(app_labels(app)),
            ..Default::default()
        }),
        status: None,
    }
}
