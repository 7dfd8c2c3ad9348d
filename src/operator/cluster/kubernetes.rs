use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::{ClusterClient, Managed};
use crate::operator::crd::{Frontend, FrontendEnvironment, FrontendStatus};
use crate::operator::error::{Error, Result};

/// ClusterClient backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    timeout: Duration,
}

impl KubeCluster {
    /// Create a new cluster client
    ///
    /// # Arguments
    /// * `client` - Kubernetes client
    /// * `field_manager` - Field manager name recorded on every write
    /// * `timeout` - Deadline applied to every API call
    pub fn new(client: Client, field_manager: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            timeout,
        }
    }

    /// Run an API call under the configured deadline and map its error
    async fn bounded<T, F>(&self, call: F, kind: &str, name: &str) -> Result<T>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        with_deadline(self.timeout, call, kind, name).await
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

/// Await `call` for at most `deadline`; expiry is reported as `Error::ClusterUnavailable`
async fn with_deadline<T, F>(deadline: Duration, call: F, kind: &str, name: &str) -> Result<T>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::from_kube(e, kind, name)),
        Err(_) => Err(Error::ClusterUnavailable(format!(
            "deadline of {:?} exceeded for {} {}",
            deadline, kind, name
        ))),
    }
}

fn object_name<K: Resource>(object: &K) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::InvalidResource("object has no name".to_string()))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name), &K::kind(&()), name).await
    }

    async fn create<K: Managed>(&self, namespace: &str, object: &K) -> Result<K> {
        let name = object_name(object)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = self.post_params();
        debug!(kind = %K::kind(&()), namespace, name = %name, "Creating object");
        self.bounded(api.create(&params, object), &K::kind(&()), &name)
            .await
    }

    async fn replace<K: Managed>(&self, namespace: &str, object: &K) -> Result<K> {
        let name = object_name(object)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = self.post_params();
        debug!(kind = %K::kind(&()), namespace, name = %name, "Replacing object");
        self.bounded(api.replace(&name, &params, object), &K::kind(&()), &name)
            .await
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams::default();
        match self
            .bounded(api.delete(name, &params), &K::kind(&()), name)
            .await
        {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let list = self
            .bounded(api.list(&params), &K::plural(&()), namespace)
            .await?;
        Ok(list.items)
    }

    async fn get_environment(&self, name: &str) -> Result<Option<FrontendEnvironment>> {
        let api: Api<FrontendEnvironment> = Api::all(self.client.clone());
        self.bounded(api.get_opt(name), "FrontendEnvironment", name)
            .await
    }

    async fn list_frontends(&self) -> Result<Vec<Frontend>> {
        let api: Api<Frontend> = Api::all(self.client.clone());
        let list = self
            .bounded(api.list(&ListParams::default()), "Frontend", "*")
            .await?;
        Ok(list.items)
    }

    async fn write_frontend_status(
        &self,
        frontend: &Frontend,
        status: &FrontendStatus,
    ) -> Result<()> {
        let name = frontend.name_any();
        let namespace = frontend
            .namespace()
            .ok_or_else(|| Error::InvalidResource(format!("Frontend {} has no namespace", name)))?;
        let api: Api<Frontend> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.bounded(
            api.patch_status(&name, &params, &Patch::Merge(&patch)),
            "Frontend",
            &name,
        )
        .await?;
        Ok(())
    }
}
