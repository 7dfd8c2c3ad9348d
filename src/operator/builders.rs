//! Pure builders for every child resource kind.
//!
//! Each builder takes the desired state and the prior object (as fetched, or empty) and
//! returns the object with the fields this operator owns filled in. Fields it does not own,
//! including anything the API server defaulted, are left as they were.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, Service,
    ServicePort, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::operator::crd::{Frontend, FrontendEnvironment, ReverseProxySpec};
use crate::operator::labels::managed_labels;

pub const FRONTEND_COMPONENT: &str = "frontend";
pub const CONFIG_SERVICE_COMPONENT: &str = "config-service";
pub const REVERSE_PROXY_COMPONENT: &str = "reverse-proxy";
pub const API_CATALOG_COMPONENT: &str = "api-catalog";

pub const HTTP_PORT: i32 = 80;
pub const CONFIG_SERVICE_PORT: i32 = 8000;
pub const REVERSE_PROXY_PORT: i32 = 8080;

pub const NAVIGATION_KEY: &str = "navigation.json";
pub const API_CATALOG_KEY: &str = "api-specs.json";

const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/config";

const DEFAULT_LOG_LEVEL: &str = "DEBUG";
const DEFAULT_SPA_ENTRYPOINT_PATH: &str = "/index.html";

/// Name of the config map and config-service deployment of a frontend
pub fn config_name(frontend: &Frontend) -> String {
    format!("{}-config", frontend.name_any())
}

/// Name of the shared reverse proxy deployment and service, derived only from the environment
pub fn reverse_proxy_name(environment: &FrontendEnvironment) -> String {
    format!("{}-reverse-proxy", environment.name_any())
}

/// Name of the API catalog config map of an environment
pub fn catalog_name(environment: &FrontendEnvironment) -> String {
    format!("{}-api-specs", environment.name_any())
}

/// Whether a frontend gets an ingress in the given environment
pub fn wants_ingress(frontend: &Frontend, environment: &FrontendEnvironment) -> bool {
    let has_host = environment
        .spec
        .hostname
        .as_deref()
        .is_some_and(|host| !host.is_empty());
    has_host && !frontend.spec.paths.is_empty()
}

/// Upstream URL of the object store, inferring the scheme from the port
///
/// Examples:
/// - ("s3.example.com", "443") → "https://s3.example.com"
/// - ("localhost", "80") → "http://localhost"
/// - ("minio.local", "9000") → "http://minio.local:9000"
pub fn object_store_upstream(endpoint: &str, port: &str) -> String {
    let endpoint = endpoint.trim();
    match port.trim() {
        "443" => format!("https://{}", endpoint),
        "80" | "" => format!("http://{}", endpoint),
        other => format!("http://{}:{}", endpoint, other),
    }
}

/// Add `owner` to the owner references, replacing an existing entry with the same uid
pub fn set_owner_reference(metadata: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = metadata.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => refs.push(owner.clone()),
    }
}

/// Reduce the pod to exactly one container named `name` and return it
///
/// An existing container with that name is kept so server-defaulted fields survive.
fn single_container<'a>(pod: &'a mut PodSpec, name: &str) -> &'a mut Container {
    pod.containers.retain(|c| c.name == name);
    if pod.containers.is_empty() {
        pod.containers.push(Container {
            name: name.to_string(),
            ..Default::default()
        });
    }
    &mut pod.containers[0]
}

fn http_container_port(port: i32) -> ContainerPort {
    ContainerPort {
        name: Some("http".to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Shape a deployment around a single container selected by `labels`; returns the pod spec
fn deployment_skeleton<'a>(
    deployment: &'a mut Deployment,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> &'a mut PodSpec {
    set_owner_reference(&mut deployment.metadata, owner);

    let spec = deployment.spec.get_or_insert_with(Default::default);
    if spec.replicas.is_none() {
        spec.replicas = Some(1);
    }
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels = Some(labels.clone());
    spec.template.spec.get_or_insert_with(Default::default)
}

fn service_skeleton(
    service: &mut Service,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
    port: i32,
) {
    set_owner_reference(&mut service.metadata, owner);

    let spec = service.spec.get_or_insert_with(Default::default);
    spec.type_ = Some("ClusterIP".to_string());
    spec.selector = Some(labels.clone());
    spec.ports = Some(vec![ServicePort {
        name: Some("http".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]);
}

/// Deployment serving the frontend assets
pub fn frontend_deployment(
    frontend: &Frontend,
    owner: &OwnerReference,
    mut deployment: Deployment,
) -> Deployment {
    let labels = managed_labels(FRONTEND_COMPONENT, &frontend.name_any());
    let pod = deployment_skeleton(&mut deployment, &labels, owner);

    let container = single_container(pod, FRONTEND_COMPONENT);
    container.image = Some(frontend.spec.image.clone());
    container.ports = Some(vec![http_container_port(HTTP_PORT)]);

    deployment
}

/// ClusterIP service in front of the frontend deployment
pub fn frontend_service(
    frontend: &Frontend,
    owner: &OwnerReference,
    mut service: Service,
) -> Service {
    let labels = managed_labels(FRONTEND_COMPONENT, &frontend.name_any());
    service_skeleton(&mut service, &labels, owner, HTTP_PORT);
    service
}

/// Ingress routing each frontend path on the environment hostname to the frontend service
pub fn frontend_ingress(
    frontend: &Frontend,
    environment: &FrontendEnvironment,
    owner: &OwnerReference,
    mut ingress: Ingress,
) -> Ingress {
    set_owner_reference(&mut ingress.metadata, owner);

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: frontend.name_any(),
            port: Some(ServiceBackendPort {
                name: Some("http".to_string()),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    let paths = frontend
        .spec
        .paths
        .iter()
        .map(|path| HTTPIngressPath {
            path: Some(path.clone()),
            path_type: "Prefix".to_string(),
            backend: backend.clone(),
        })
        .collect();

    let spec = ingress.spec.get_or_insert_with(Default::default);
    spec.ingress_class_name = environment.spec.ingress_class.clone();
    spec.rules = Some(vec![IngressRule {
        host: environment.spec.hostname.clone(),
        http: Some(HTTPIngressRuleValue { paths }),
    }]);

    ingress
}

/// Config map holding the frontend's navigation metadata
pub fn config_map(
    frontend: &Frontend,
    owner: &OwnerReference,
    mut config_map: ConfigMap,
) -> ConfigMap {
    set_owner_reference(&mut config_map.metadata, owner);

    let navigation = frontend
        .spec
        .navigation
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(NAVIGATION_KEY.to_string(), navigation.to_string());

    config_map
}

fn config_volume(pod: &mut PodSpec, config_map_name: &str) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    let existing = volumes
        .iter_mut()
        .find(|v| v.name == CONFIG_VOLUME)
        .and_then(|v| v.config_map.as_mut());

    match existing {
        Some(source) => source.name = config_map_name.to_string().into(),
        None => {
            let mut source = ConfigMapVolumeSource::default();
            source.name = config_map_name.to_string().into();
            volumes.retain(|v| v.name != CONFIG_VOLUME);
            volumes.push(Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(source),
                ..Default::default()
            });
        }
    }
}

/// Deployment serving the frontend's config map over HTTP
pub fn config_service_deployment(
    frontend: &Frontend,
    image: &str,
    owner: &OwnerReference,
    mut deployment: Deployment,
) -> Deployment {
    let labels = managed_labels(CONFIG_SERVICE_COMPONENT, &frontend.name_any());
    let pod = deployment_skeleton(&mut deployment, &labels, owner);
    config_volume(pod, &config_name(frontend));

    let container = single_container(pod, CONFIG_SERVICE_COMPONENT);
    container.image = Some(image.to_string());
    container.ports = Some(vec![http_container_port(CONFIG_SERVICE_PORT)]);
    container.env = Some(vec![
        env_var("CONFIG_PATH", CONFIG_MOUNT_PATH),
        env_var("SERVER_PORT", CONFIG_SERVICE_PORT.to_string()),
    ]);
    container.volume_mounts = Some(vec![VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }]);

    deployment
}

/// Environment of the reverse proxy container
pub fn reverse_proxy_env(proxy: &ReverseProxySpec) -> Vec<EnvVar> {
    let log_level = proxy
        .log_level
        .as_deref()
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let entrypoint = proxy
        .spa_entrypoint_path
        .as_deref()
        .filter(|path| !path.is_empty())
        .unwrap_or(DEFAULT_SPA_ENTRYPOINT_PATH);

    vec![
        env_var("SERVER_PORT", REVERSE_PROXY_PORT.to_string()),
        env_var(
            "MINIO_UPSTREAM_URL",
            object_store_upstream(&proxy.object_store_endpoint, &proxy.object_store_port),
        ),
        env_var("BUCKET_PATH_PREFIX", proxy.bucket.clone()),
        env_var("LOG_LEVEL", log_level),
        env_var("SPA_ENTRYPOINT_PATH", entrypoint),
    ]
}

/// Shared caching reverse proxy of an environment
pub fn reverse_proxy_deployment(
    environment: &FrontendEnvironment,
    proxy: &ReverseProxySpec,
    owner: &OwnerReference,
    mut deployment: Deployment,
) -> Deployment {
    let labels = managed_labels(REVERSE_PROXY_COMPONENT, &environment.name_any());
    let pod = deployment_skeleton(&mut deployment, &labels, owner);

    let container = single_container(pod, REVERSE_PROXY_COMPONENT);
    container.image = Some(proxy.image.clone());
    container.ports = Some(vec![http_container_port(REVERSE_PROXY_PORT)]);
    container.env = Some(reverse_proxy_env(proxy));

    deployment
}

pub fn reverse_proxy_service(
    environment: &FrontendEnvironment,
    owner: &OwnerReference,
    mut service: Service,
) -> Service {
    let labels = managed_labels(REVERSE_PROXY_COMPONENT, &environment.name_any());
    service_skeleton(&mut service, &labels, owner, REVERSE_PROXY_PORT);
    service
}

/// Config map publishing the rendered API catalog of an environment
pub fn catalog_config_map(
    catalog_json: &str,
    owner: &OwnerReference,
    mut config_map: ConfigMap,
) -> ConfigMap {
    set_owner_reference(&mut config_map.metadata, owner);
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(API_CATALOG_KEY.to_string(), catalog_json.to_string());
    config_map
}
