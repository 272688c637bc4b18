//! AppService Custom Resource Definition
//!
//! An AppService describes a deployable application: a container image run
//! as a number of replicas and exposed through a set of service ports.

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, ServicePort};
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject, SingleOrVec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of an application
///
/// `PartialEq` is structural and is what change detection compares against
/// the last-applied snapshot, so every field here participates in it.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "batch.appservice.com",
    version = "v1",
    kind = "AppService",
    namespaced,
    status = "AppServiceStatus",
    shortname = "as",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceSpec {
    /// Container image, optionally tagged (`repo[:tag]`)
    pub image: String,

    /// Desired replica count; defaulted to 1 at admission when unset or negative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Ports exposed by the Service; `targetPort` is also opened on the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "object_list_schema")]
    pub ports: Vec<ServicePort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "object_schema")]
    pub resources: Option<ResourceRequirements>,

    /// Environment variables passed verbatim to the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "object_list_schema")]
    pub envs: Vec<EnvVar>,
}

/// Observed state of an AppService
///
/// Declared for the CRD schema; the reconciler does not write it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceStatus {}

/// Structural schema for an embedded Kubernetes object
///
/// The API server validates the nested fields itself when the children are
/// written, so the CRD only pins the node type.
fn object_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

fn object_list_schema(gen: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(SingleOrVec::Single(Box::new(object_schema(gen)))),
            ..Default::default()
        })),
        ..Default::default()
    })
}
