//! Resource store abstraction used by the reconciler
//!
//! The reconciler never talks to `kube::Api` directly; it is handed a
//! [`ResourceStore`] at construction so the whole state machine can run
//! against an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::AppService;
use crate::error::Error;

/// Field manager recorded on every write made by the operator
pub const FIELD_MANAGER: &str = "appservice-operator";

/// Operations the reconciler needs from the cluster
///
/// `get_*` return `Ok(None)` when the object does not exist and `delete_*`
/// return `Ok(false)` for the same case. An optimistic concurrency failure
/// surfaces as [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<AppService>, Error>;

    /// Replace the whole AppService, guarded by its `resourceVersion`
    async fn update_app(&self, app: &AppService) -> Result<AppService, Error>;

    /// Apply a JSON merge patch to an AppService
    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<AppService, Error>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    async fn update_service(&self, service: &Service) -> Result<Service, Error>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apps(&self, namespace: &str) -> Api<AppService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error, turning HTTP 409 into [`Error::Conflict`]
fn classify(kind: &'static str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind,
            name: name.to_string(),
        },
        e => Error::KubeError(e),
    }
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<AppService>, Error> {
        Ok(self.apps(namespace).get_opt(name).await?)
    }

    async fn update_app(&self, app: &AppService) -> Result<AppService, Error> {
        let name = app.name_any();
        self.apps(&namespace_of(app))
            .replace(&name, &post_params(), app)
            .await
            .map_err(|e| classify("AppService", &name, e))
    }

    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<AppService, Error> {
        debug!("Patching AppService {}/{}: {}", namespace, name, patch);
        self.apps(namespace)
            .patch(
                name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| classify("AppService", name, e))
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let name = deployment.name_any();
        info!("Creating Deployment {}", name);
        self.deployments(&namespace_of(deployment))
            .create(&post_params(), deployment)
            .await
            .map_err(|e| classify("Deployment", &name, e))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let name = deployment.name_any();
        info!("Updating Deployment {}", name);
        self.deployments(&namespace_of(deployment))
            .replace(&name, &post_params(), deployment)
            .await
            .map_err(|e| classify("Deployment", &name, e))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted Deployment {}", name);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let name = service.name_any();
        info!("Creating Service {}", name);
        self.services(&namespace_of(service))
            .create(&post_params(), service)
            .await
            .map_err(|e| classify("Service", &name, e))
    }

    async fn update_service(&self, service: &Service) -> Result<Service, Error> {
        let name = service.name_any();
        info!("Updating Service {}", name);
        self.services(&namespace_of(service))
            .replace(&name, &post_params(), service)
            .await
            .map_err(|e| classify("Service", &name, e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted Service {}", name);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}
