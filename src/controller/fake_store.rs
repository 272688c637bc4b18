//! In-memory [`ResourceStore`] for tests
//!
//! Mimics the API server behaviour the reconciler depends on: resource
//! versions with optimistic concurrency, merge patches, clusterIP allocation
//! and immutability, finalizer-gated deletion and owner-reference cascade.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde_json::Value;

use super::store::ResourceStore;
use crate::crd::{AppService, AppServiceSpec};
use crate::error::Error;

type Key = (String, String);

/// Build an AppService as the API server would return it after admission
pub fn test_app(name: &str, namespace: &str) -> AppService {
    let mut app = AppService::new(
        name,
        AppServiceSpec {
            image: "nginx:latest".to_string(),
            replicas: Some(2),
            ports: vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }],
            resources: None,
            envs: vec![],
        },
    );
    app.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{namespace}-{name}")),
        generation: Some(1),
        ..Default::default()
    };
    app
}

#[derive(Default)]
struct State {
    apps: BTreeMap<Key, AppService>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    version: u64,
    next_ip: u8,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Counters of child mutations performed through the store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChildWrites {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    writes: Mutex<ChildWrites>,
    app_updates: Mutex<Vec<AppService>>,
    failures: Mutex<HashSet<&'static str>>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn key_of<K: kube::Resource>(obj: &K) -> Key {
    key(
        &obj.namespace().unwrap_or_else(|| "default".to_string()),
        &obj.name_any(),
    )
}

fn conflict(kind: &'static str, name: &str) -> Error {
    Error::Conflict {
        kind,
        name: name.to_string(),
    }
}

/// Children without owner references are never collected
fn owned_by_live(live: &HashSet<String>, owners: &Option<Vec<OwnerReference>>) -> bool {
    match owners {
        Some(owners) if !owners.is_empty() => owners.iter().any(|o| live.contains(&o.uid)),
        _ => true,
    }
}

impl FakeStore {
    /// Store an AppService as if a user had created it
    pub fn insert_app(&self, mut app: AppService) -> AppService {
        let mut state = self.state.lock().unwrap();
        app.metadata.resource_version = Some(state.next_version());
        state.apps.insert(key_of(&app), app.clone());
        app
    }

    pub fn app(&self, namespace: &str, name: &str) -> Option<AppService> {
        self.state
            .lock()
            .unwrap()
            .apps
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    /// Edit an AppService as an external actor would, bumping its version
    pub fn edit_app(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut AppService)) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(app) = state.apps.get_mut(&key(namespace, name)) {
            edit(app);
            app.metadata.resource_version = Some(version);
        }
    }

    /// Request deletion: objects with finalizers only get a deletion timestamp
    pub fn request_delete_app(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let k = key(namespace, name);
        let blocked = match state.apps.get_mut(&k) {
            Some(app) if !app.finalizers().is_empty() => {
                app.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                app.metadata.resource_version = Some(version);
                true
            }
            _ => false,
        };
        if !blocked {
            state.apps.remove(&k);
            Self::collect_garbage(&mut state);
        }
    }

    /// Remove an AppService ignoring finalizers, then run the owner cascade
    pub fn force_delete_app(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.apps.remove(&key(namespace, name));
        Self::collect_garbage(&mut state);
    }

    pub fn delete_service_externally(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .services
            .remove(&key(namespace, name));
    }

    /// Make the next call of `operation` fail with a transport-like error
    pub fn fail_next(&self, operation: &'static str) {
        self.failures.lock().unwrap().insert(operation);
    }

    pub fn child_writes(&self) -> ChildWrites {
        *self.writes.lock().unwrap()
    }

    /// Every AppService written through `update_app`, oldest first
    pub fn app_updates(&self) -> Vec<AppService> {
        self.app_updates.lock().unwrap().clone()
    }

    fn check_failure(&self, operation: &'static str) -> Result<(), Error> {
        if self.failures.lock().unwrap().remove(operation) {
            return Err(Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected failure in {operation}"),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })));
        }
        Ok(())
    }

    fn record(&self, update: impl FnOnce(&mut ChildWrites)) {
        update(&mut self.writes.lock().unwrap());
    }

    /// Drop children whose owner no longer exists
    fn collect_garbage(state: &mut State) {
        let live: HashSet<String> = state
            .apps
            .values()
            .filter_map(|a| a.metadata.uid.clone())
            .collect();
        state
            .deployments
            .retain(|_, d| owned_by_live(&live, &d.metadata.owner_references));
        state
            .services
            .retain(|_, s| owned_by_live(&live, &s.metadata.owner_references));
    }

    /// Finish a pending deletion once the last finalizer is gone
    fn settle_deletion(state: &mut State, k: &Key) {
        let finished = state
            .apps
            .get(k)
            .map(|a| a.metadata.deletion_timestamp.is_some() && a.finalizers().is_empty())
            .unwrap_or(false);
        if finished {
            state.apps.remove(k);
            Self::collect_garbage(state);
        }
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<AppService>, Error> {
        self.check_failure("get_app")?;
        Ok(self.app(namespace, name))
    }

    async fn update_app(&self, app: &AppService) -> Result<AppService, Error> {
        self.check_failure("update_app")?;
        let mut state = self.state.lock().unwrap();
        let k = key_of(app);
        let current = state
            .apps
            .get(&k)
            .cloned()
            .ok_or_else(|| conflict("AppService", &app.name_any()))?;
        if app.metadata.resource_version != current.metadata.resource_version {
            return Err(conflict("AppService", &app.name_any()));
        }

        let mut stored = app.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.apps.insert(k.clone(), stored.clone());
        Self::settle_deletion(&mut state, &k);
        drop(state);

        self.app_updates.lock().unwrap().push(app.clone());
        Ok(stored)
    }

    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<AppService, Error> {
        self.check_failure("patch_app")?;
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let current = state
            .apps
            .get(&k)
            .cloned()
            .ok_or_else(|| conflict("AppService", name))?;

        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(conflict("AppService", name));
            }
        }

        let mut value = serde_json::to_value(&current)?;
        json_patch::merge(&mut value, patch);
        let mut patched: AppService = serde_json::from_value(value)?;
        patched.metadata.resource_version = Some(state.next_version());
        state.apps.insert(k.clone(), patched.clone());
        Self::settle_deletion(&mut state, &k);
        Ok(patched)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        self.check_failure("get_deployment")?;
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.check_failure("create_deployment")?;
        let mut state = self.state.lock().unwrap();
        let k = key_of(deployment);
        if state.deployments.contains_key(&k) {
            return Err(conflict("Deployment", &deployment.name_any()));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.deployments.insert(k, stored.clone());
        drop(state);
        self.record(|w| w.creates += 1);
        Ok(stored)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.check_failure("update_deployment")?;
        let mut state = self.state.lock().unwrap();
        let k = key_of(deployment);
        if !state.deployments.contains_key(&k) {
            return Err(conflict("Deployment", &deployment.name_any()));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.deployments.insert(k, stored.clone());
        drop(state);
        self.record(|w| w.updates += 1);
        Ok(stored)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.check_failure("delete_deployment")?;
        let removed = self
            .state
            .lock()
            .unwrap()
            .deployments
            .remove(&key(namespace, name))
            .is_some();
        if removed {
            self.record(|w| w.deletes += 1);
        }
        Ok(removed)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.check_failure("get_service")?;
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        self.check_failure("create_service")?;
        let mut state = self.state.lock().unwrap();
        let k = key_of(service);
        if state.services.contains_key(&k) {
            return Err(conflict("Service", &service.name_any()));
        }
        state.next_ip += 1;
        let ip = format!("10.96.0.{}", state.next_ip);

        let mut stored = service.clone();
        let spec = stored.spec.get_or_insert_with(Default::default);
        spec.cluster_ip = Some(ip.clone());
        spec.cluster_ips = Some(vec![ip]);
        stored.metadata.resource_version = Some(state.next_version());
        state.services.insert(k, stored.clone());
        drop(state);
        self.record(|w| w.creates += 1);
        Ok(stored)
    }

    async fn update_service(&self, service: &Service) -> Result<Service, Error> {
        self.check_failure("update_service")?;
        let mut state = self.state.lock().unwrap();
        let k = key_of(service);
        let current = state
            .services
            .get(&k)
            .cloned()
            .ok_or_else(|| conflict("Service", &service.name_any()))?;

        let allocated = current.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        let requested = service.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        if allocated != requested {
            return Err(Error::ConfigError(
                "spec.clusterIP: Invalid value: field is immutable".to_string(),
            ));
        }

        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.services.insert(k, stored.clone());
        drop(state);
        self.record(|w| w.updates += 1);
        Ok(stored)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.check_failure("delete_service")?;
        let removed = self
            .state
            .lock()
            .unwrap()
            .services
            .remove(&key(namespace, name))
            .is_some();
        if removed {
            self.record(|w| w.deletes += 1);
        }
        Ok(removed)
    }
}
