mod kubernetes;
#[cfg(test)]
pub mod memory;

pub use kubernetes::KubeCluster;

use async_trait::async_trait;
use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::operator::crd::{Frontend, FrontendEnvironment, FrontendStatus};
use crate::operator::error::Result;

/// Namespaced child resource kinds the engine can manage
/// (Deployment, Service, Ingress, ConfigMap)
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Default
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Default
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Access to cluster state used by the reconciliation engine
///
/// Reads are expected to be consistent with writes made earlier in the same pass.
/// Implementations bound every call with a deadline and report expiry as
/// `Error::ClusterUnavailable`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a namespaced object, `None` when it does not exist
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Create an object; fails with `Error::AlreadyExists` if the name is taken
    async fn create<K: Managed>(&self, namespace: &str, object: &K) -> Result<K>;

    /// Replace an object, guarded by the resourceVersion carried in `object`
    async fn replace<K: Managed>(&self, namespace: &str, object: &K) -> Result<K>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()>;

    /// List objects in a namespace matching a label selector
    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>;

    /// Get a (cluster-scoped) FrontendEnvironment
    async fn get_environment(&self, name: &str) -> Result<Option<FrontendEnvironment>>;

    /// List Frontends across all namespaces
    async fn list_frontends(&self) -> Result<Vec<Frontend>>;

    /// Overwrite the status sub-resource of a Frontend
    async fn write_frontend_status(&self, frontend: &Frontend, status: &FrontendStatus)
        -> Result<()>;
}
