//! Ownership of the per-environment reverse proxy.
//!
//! Many frontends reference one environment, but the environment gets a single reverse proxy
//! deployment and service. They are named after the environment and owned by it, never by a
//! frontend, so deleting any frontend leaves them in place. Frontend passes only create them
//! when missing; updates and teardown happen on the environment's own pass.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::operator::builders::{self, REVERSE_PROXY_COMPONENT};
use crate::operator::cache::{CommitOutcome, ObjectCache};
use crate::operator::cluster::{ClusterClient, Managed};
use crate::operator::crd::FrontendEnvironment;
use crate::operator::error::{Error, Result};

/// Result of creating a shared resource
#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    /// The resource was already there, or another pass created it first
    AlreadyExisted,
    Failed(Error),
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Convert into a result, tagging a failure with the step that produced it
    pub fn into_result(self, step: &'static str) -> Result<Self> {
        match self {
            Self::Failed(e) => Err(Error::reconcile(step, e)),
            other => Ok(other),
        }
    }
}

/// What a frontend pass did with the shared reverse proxy
#[derive(Debug)]
pub enum SharedProxy {
    /// The environment has no enabled reverse proxy
    NotWanted,
    Ensured {
        deployment: CreateOutcome,
        service: CreateOutcome,
    },
}

impl SharedProxy {
    /// Number of objects created by this pass
    pub fn created(&self) -> usize {
        match self {
            Self::NotWanted => 0,
            Self::Ensured {
                deployment,
                service,
            } => [deployment, service]
                .iter()
                .filter(|outcome| outcome.is_created())
                .count(),
        }
    }
}

/// Controller owner reference pointing at the environment
pub fn environment_owner(environment: &FrontendEnvironment) -> Result<OwnerReference> {
    environment.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidResource(format!(
            "FrontendEnvironment {} has no uid",
            environment.name_any()
        ))
    })
}

/// Create `name` if it does not exist yet; an existing object is left untouched
async fn create_if_missing<K, C>(
    cache: &mut ObjectCache<'_, C>,
    namespace: &str,
    name: &str,
    owner_key: &str,
    build: impl FnOnce(K) -> K,
) -> CreateOutcome
where
    K: Managed,
    C: ClusterClient,
{
    let staged = match cache.fetch_or_init::<K>(namespace, name).await {
        Ok(staged) => staged,
        Err(e) => return CreateOutcome::Failed(e),
    };
    if staged.existed {
        return CreateOutcome::AlreadyExisted;
    }

    match cache
        .commit(staged.map(build), REVERSE_PROXY_COMPONENT, owner_key)
        .await
    {
        Ok(_) => {
            info!(kind = %K::kind(&()), namespace, name, "Created shared reverse proxy object");
            CreateOutcome::Created
        }
        Err(e) if e.is_already_exists() => {
            debug!(kind = %K::kind(&()), namespace, name, "Shared object created concurrently");
            CreateOutcome::AlreadyExisted
        }
        Err(e) => CreateOutcome::Failed(e),
    }
}

/// Make sure the environment's reverse proxy exists, on behalf of a frontend pass
///
/// A disabled proxy is a no-op here; nothing is deleted from a frontend pass. When the
/// deployment is created but the service fails, the next pass creates only the service.
pub async fn ensure_for_frontend<C: ClusterClient>(
    cache: &mut ObjectCache<'_, C>,
    environment: &FrontendEnvironment,
    namespace: &str,
) -> Result<SharedProxy> {
    let Some(proxy) = environment.enabled_reverse_proxy() else {
        return Ok(SharedProxy::NotWanted);
    };
    let owner = environment_owner(environment)?;
    let name = builders::reverse_proxy_name(environment);
    let env_name = environment.name_any();

    let deployment = create_if_missing::<Deployment, _>(cache, namespace, &name, &env_name, |d| {
        builders::reverse_proxy_deployment(environment, proxy, &owner, d)
    })
    .await
    .into_result("create reverse-proxy deployment")?;

    let service = create_if_missing::<Service, _>(cache, namespace, &name, &env_name, |s| {
        builders::reverse_proxy_service(environment, &owner, s)
    })
    .await
    .into_result("create reverse-proxy service")?;

    Ok(SharedProxy::Ensured {
        deployment,
        service,
    })
}

/// Bring the reverse proxy in line with the environment spec; returns the number of writes
///
/// Runs on the environment's own pass. An explicitly disabled proxy is torn down; an
/// environment without proxy settings is left alone.
pub async fn sync_for_environment<C: ClusterClient>(
    cache: &mut ObjectCache<'_, C>,
    environment: &FrontendEnvironment,
    namespace: &str,
) -> Result<usize> {
    let name = builders::reverse_proxy_name(environment);

    let Some(proxy) = environment.enabled_reverse_proxy() else {
        if environment.reverse_proxy_disabled() {
            teardown(cache.client(), environment, namespace).await?;
        }
        return Ok(0);
    };

    let owner = environment_owner(environment)?;
    let env_name = environment.name_any();
    let mut writes = 0;

    let staged = cache
        .fetch_or_init::<Deployment>(namespace, &name)
        .await
        .map_err(|e| Error::reconcile("fetch reverse-proxy deployment", e))?
        .map(|d| builders::reverse_proxy_deployment(environment, proxy, &owner, d));
    let (_, outcome) = cache
        .commit(staged, REVERSE_PROXY_COMPONENT, &env_name)
        .await
        .map_err(|e| Error::reconcile("apply reverse-proxy deployment", e))?;
    if outcome != CommitOutcome::Unchanged {
        writes += 1;
    }

    let staged = cache
        .fetch_or_init::<Service>(namespace, &name)
        .await
        .map_err(|e| Error::reconcile("fetch reverse-proxy service", e))?
        .map(|s| builders::reverse_proxy_service(environment, &owner, s));
    let (_, outcome) = cache
        .commit(staged, REVERSE_PROXY_COMPONENT, &env_name)
        .await
        .map_err(|e| Error::reconcile("apply reverse-proxy service", e))?;
    if outcome != CommitOutcome::Unchanged {
        writes += 1;
    }

    Ok(writes)
}

/// Delete the environment's reverse proxy; missing objects are fine
pub async fn teardown<C: ClusterClient>(
    client: &C,
    environment: &FrontendEnvironment,
    namespace: &str,
) -> Result<()> {
    let name = builders::reverse_proxy_name(environment);
    client
        .delete::<Service>(namespace, &name)
        .await
        .map_err(|e| Error::reconcile("delete reverse-proxy service", e))?;
    client
        .delete::<Deployment>(namespace, &name)
        .await
        .map_err(|e| Error::reconcile("delete reverse-proxy deployment", e))?;
    info!(
        environment = %environment.name_any(),
        namespace,
        "Reverse proxy disabled, removed shared objects"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::cluster::memory::MemoryCluster;
    use crate::operator::crd::{FrontendEnvironmentSpec, ReverseProxySpec};

    const NS: &str = "rise-system";

    fn environment(enabled: bool) -> FrontendEnvironment {
        FrontendEnvironment::new(
            "stage",
            FrontendEnvironmentSpec {
                reverse_proxy: Some(ReverseProxySpec {
                    enabled,
                    image: "quay.io/org/proxy:1".to_string(),
                    object_store_endpoint: "minio.local".to_string(),
                    object_store_port: "9000".to_string(),
                    bucket: "frontends".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_disabled_proxy_is_noop_on_frontend_pass() {
        let cluster = MemoryCluster::new();
        let env = cluster.insert_environment(environment(false));
        let mut cache = ObjectCache::new(&cluster);

        let shared = ensure_for_frontend(&mut cache, &env, NS).await.unwrap();
        assert!(matches!(shared, SharedProxy::NotWanted));
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_creates_once_owned_by_environment() {
        let cluster = MemoryCluster::new();
        let env = cluster.insert_environment(environment(true));

        let mut cache = ObjectCache::new(&cluster);
        let shared = ensure_for_frontend(&mut cache, &env, NS).await.unwrap();
        assert_eq!(shared.created(), 2);

        let mut cache = ObjectCache::new(&cluster);
        let shared = ensure_for_frontend(&mut cache, &env, NS).await.unwrap();
        assert_eq!(shared.created(), 0);
        assert_eq!(cluster.writes(), 2);

        let deployment: Deployment = cluster.object(NS, "stage-reverse-proxy").unwrap();
        let owners = deployment.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "FrontendEnvironment");
        assert_eq!(Some(owners[0].uid.clone()), env.uid());
    }

    #[tokio::test]
    async fn test_concurrent_create_is_absorbed() {
        let cluster = MemoryCluster::new();
        let env = cluster.insert_environment(environment(true));

        // Both passes observe "absent" before either creates
        let mut first = ObjectCache::new(&cluster);
        let mut second = ObjectCache::new(&cluster);
        let name = builders::reverse_proxy_name(&env);
        let a = first.fetch_or_init::<Service>(NS, &name).await.unwrap();
        let b = second.fetch_or_init::<Service>(NS, &name).await.unwrap();
        assert!(!a.existed && !b.existed);

        first.commit(a, REVERSE_PROXY_COMPONENT, "stage").await.unwrap();
        let err = second
            .commit(b, REVERSE_PROXY_COMPONENT, "stage")
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        // A later attempt through the resolver sees the winner's object
        let mut third = ObjectCache::new(&cluster);
        let outcome = create_if_missing::<Service, _>(&mut third, NS, &name, "stage", |s| s).await;
        assert!(matches!(outcome, CreateOutcome::AlreadyExisted));
    }

    #[tokio::test]
    async fn test_partial_creation_completes_on_next_pass() {
        let cluster = MemoryCluster::new();
        let env = cluster.insert_environment(environment(true));
        cluster.fail_next_create::<Service>();

        let mut cache = ObjectCache::new(&cluster);
        let err = ensure_for_frontend(&mut cache, &env, NS).await.unwrap_err();
        assert!(err.to_string().starts_with("create reverse-proxy service"));
        assert_eq!(cluster.writes(), 1);

        let mut cache = ObjectCache::new(&cluster);
        let shared = ensure_for_frontend(&mut cache, &env, NS).await.unwrap();
        match shared {
            SharedProxy::Ensured {
                deployment,
                service,
            } => {
                assert!(matches!(deployment, CreateOutcome::AlreadyExisted));
                assert!(service.is_created());
            }
            SharedProxy::NotWanted => panic!("proxy should be ensured"),
        }
        assert_eq!(cluster.writes(), 2);
    }

    #[tokio::test]
    async fn test_environment_pass_updates_and_tears_down() {
        let cluster = MemoryCluster::new();
        let mut env = cluster.insert_environment(environment(true));

        let mut cache = ObjectCache::new(&cluster);
        assert_eq!(sync_for_environment(&mut cache, &env, NS).await.unwrap(), 2);

        let mut cache = ObjectCache::new(&cluster);
        assert_eq!(sync_for_environment(&mut cache, &env, NS).await.unwrap(), 0);

        env.spec.reverse_proxy.as_mut().unwrap().image = "quay.io/org/proxy:2".to_string();
        let mut cache = ObjectCache::new(&cluster);
        assert_eq!(sync_for_environment(&mut cache, &env, NS).await.unwrap(), 1);
        let deployment: Deployment = cluster.object(NS, "stage-reverse-proxy").unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("quay.io/org/proxy:2"));

        env.spec.reverse_proxy.as_mut().unwrap().enabled = false;
        let mut cache = ObjectCache::new(&cluster);
        sync_for_environment(&mut cache, &env, NS).await.unwrap();
        assert!(cluster.object::<Deployment>(NS, "stage-reverse-proxy").is_none());
        assert!(cluster.object::<Service>(NS, "stage-reverse-proxy").is_none());
    }

    #[tokio::test]
    async fn test_environment_without_proxy_settings_keeps_objects() {
        let cluster = MemoryCluster::new();
        let env = cluster.insert_environment(environment(true));
        let mut cache = ObjectCache::new(&cluster);
        sync_for_environment(&mut cache, &env, NS).await.unwrap();

        let mut bare = env.clone();
        bare.spec.reverse_proxy = None;
        let mut cache = ObjectCache::new(&cluster);
        assert_eq!(sync_for_environment(&mut cache, &bare, NS).await.unwrap(), 0);
        assert!(cluster.object::<Deployment>(NS, "stage-reverse-proxy").is_some());
    }
}
