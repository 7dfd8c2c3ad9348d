use kube::CustomResource;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "rise.dev";
pub const API_VERSION: &str = "v1alpha1";

/// A deployable web frontend
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "rise.dev",
    version = "v1alpha1",
    kind = "Frontend",
    namespaced,
    status = "FrontendStatus",
    shortname = "fe",
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".spec.environment"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Managed","type":"integer","jsonPath":".status.managedDeployments"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FrontendSpec {
    /// Name of the (cluster-scoped) FrontendEnvironment this frontend runs in
    pub environment: String,
    /// Container image serving the frontend assets
    pub image: String,
    /// API surface exposed by this frontend
    #[serde(default)]
    pub api_specs: Vec<ApiSpec>,
    /// Navigation metadata, published as-is through the config service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub navigation: Option<serde_json::Value>,
    /// Ingress path prefixes routed to this frontend (e.g. "/apps/inventory")
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    pub url: String,
    #[serde(default)]
    pub bundle_labels: Vec<String>,
    /// Service providing this API, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<FrontendPhase>,
    #[serde(default)]
    pub conditions: Vec<FrontendCondition>,
    #[serde(default)]
    pub managed_deployments: i32,
    #[serde(default)]
    pub ready_deployments: i32,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FrontendPhase {
    Pending,
    Settled,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Shared environment many frontends run in
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "rise.dev",
    version = "v1alpha1",
    kind = "FrontendEnvironment",
    shortname = "feenv"
)]
#[serde(rename_all = "camelCase")]
pub struct FrontendEnvironmentSpec {
    /// Public hostname frontend ingresses are served on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
    /// Shared caching reverse proxy in front of the asset object store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_proxy: Option<ReverseProxySpec>,
    /// Image of the per-frontend config service; no config service is deployed when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_service_image: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReverseProxySpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub image: String,
    /// Object store host, without scheme (e.g. "minio.local")
    #[serde(default)]
    pub object_store_endpoint: String,
    /// Object store port as a string; "443" implies https
    #[serde(default)]
    pub object_store_port: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spa_entrypoint_path: Option<String>,
}

impl FrontendEnvironment {
    /// Reverse proxy settings when the feature is switched on and has an image
    pub fn enabled_reverse_proxy(&self) -> Option<&ReverseProxySpec> {
        self.spec
            .reverse_proxy
            .as_ref()
            .filter(|proxy| proxy.enabled && !proxy.image.is_empty())
    }

    /// True only when the reverse proxy is present in the spec and explicitly switched off
    pub fn reverse_proxy_disabled(&self) -> bool {
        matches!(self.spec.reverse_proxy, Some(ref proxy) if !proxy.enabled)
    }

    pub fn config_service_image(&self) -> Option<&str> {
        self.spec
            .config_service_image
            .as_deref()
            .filter(|image| !image.is_empty())
    }
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> Schema {
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
