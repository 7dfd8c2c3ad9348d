//! Reconciliation passes for frontends and environments.
//!
//! A pass re-derives everything from the current cluster state. Frontend passes move through
//! `Pending` (environment unresolved), `Building`, `Aggregating` and end `Settled`. An error
//! ends the pass with an `Err` and phase `Failed`, with the failing step recorded on the frontend.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn, Instrument, Span};

use crate::operator::builders::{
    self, API_CATALOG_COMPONENT, CONFIG_SERVICE_COMPONENT, FRONTEND_COMPONENT,
};
use crate::operator::cache::{CommitOutcome, ObjectCache};
use crate::operator::catalog;
use crate::operator::cluster::{ClusterClient, Managed};
use crate::operator::crd::{Frontend, FrontendEnvironment, FrontendStatus};
use crate::operator::error::{Error, Result};
use crate::operator::shared;
use crate::operator::status::{self, AggregateStatus, StatusAggregator};
use crate::operator::telemetry::{reasons, EventRecorder, EventType, MetricsSink};

/// Where a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Pending,
    Building,
    Aggregating,
    Settled,
}

/// Summary of a successful pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub state: PassState,
    /// Child objects created, updated or deleted
    pub writes: usize,
    pub status: Option<AggregateStatus>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub struct Engine<C: ClusterClient> {
    client: C,
    config_namespace: String,
    metrics: Arc<dyn MetricsSink>,
}

/// Mutable state of one frontend pass
struct Pass<'a, C: ClusterClient> {
    cache: ObjectCache<'a, C>,
    state: PassState,
    writes: usize,
}

impl<'a, C: ClusterClient> Pass<'a, C> {
    /// Fetch, build and commit one object
    async fn apply<K: Managed>(
        &mut self,
        namespace: &str,
        name: &str,
        component: &str,
        owner_key: &str,
        build: impl FnOnce(K) -> K,
    ) -> Result<()> {
        let staged = self.cache.fetch_or_init::<K>(namespace, name).await?;
        let (_, outcome) = self
            .cache
            .commit(staged.map(build), component, owner_key)
            .await?;
        if outcome != CommitOutcome::Unchanged {
            self.writes += 1;
        }
        Ok(())
    }
}

impl<C: ClusterClient> Engine<C> {
    /// Create a new engine
    ///
    /// # Arguments
    /// * `client` - Cluster access used by every pass
    /// * `config_namespace` - Namespace holding shared per-environment objects
    /// * `metrics` - Sink receiving pass outcomes
    pub fn new(
        client: C,
        config_namespace: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            config_namespace: config_namespace.into(),
            metrics,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one pass for a frontend under `span`
    pub async fn reconcile_frontend(
        &self,
        frontend: &Frontend,
        span: &Span,
        events: &dyn EventRecorder,
    ) -> Result<PassReport> {
        async {
            let mut pass = Pass {
                cache: ObjectCache::new(&self.client),
                state: PassState::Pending,
                writes: 0,
            };
            let result = self.run_frontend_pass(frontend, &mut pass).await;
            self.finish_frontend_pass(frontend, pass, result, events).await
        }
        .instrument(span.clone())
        .await
    }

    async fn run_frontend_pass(
        &self,
        frontend: &Frontend,
        pass: &mut Pass<'_, C>,
    ) -> Result<Option<AggregateStatus>> {
        let environment_name = &frontend.spec.environment;
        let environment = self
            .client
            .get_environment(environment_name)
            .await
            .map_err(|e| Error::reconcile("resolve environment", e))?;
        let Some(environment) = environment else {
            return Ok(None);
        };

        pass.state = PassState::Building;
        self.build_children(frontend, &environment, pass).await?;

        pass.state = PassState::Aggregating;
        let aggregate = StatusAggregator::new(&self.client, &self.config_namespace)
            .compute(frontend)
            .await
            .map_err(|e| Error::reconcile("aggregate status", e))?;
        self.publish_catalog(&environment, &mut pass.cache, &mut pass.writes)
            .await?;

        Ok(Some(aggregate))
    }

    async fn build_children(
        &self,
        frontend: &Frontend,
        environment: &FrontendEnvironment,
        pass: &mut Pass<'_, C>,
    ) -> Result<()> {
        let name = frontend.name_any();
        let namespace = frontend.namespace().ok_or_else(|| {
            Error::InvalidResource(format!("Frontend {} has no namespace", name))
        })?;
        let owner: OwnerReference = frontend.controller_owner_ref(&()).ok_or_else(|| {
            Error::InvalidResource(format!("Frontend {} has no uid", name))
        })?;

        pass.apply::<Deployment>(&namespace, &name, FRONTEND_COMPONENT, &name, |d| {
            builders::frontend_deployment(frontend, &owner, d)
        })
        .await
        .map_err(|e| Error::reconcile("apply frontend deployment", e))?;

        pass.apply::<Service>(&namespace, &name, FRONTEND_COMPONENT, &name, |s| {
            builders::frontend_service(frontend, &owner, s)
        })
        .await
        .map_err(|e| Error::reconcile("apply frontend service", e))?;

        if builders::wants_ingress(frontend, environment) {
            pass.apply::<Ingress>(&namespace, &name, FRONTEND_COMPONENT, &name, |i| {
                builders::frontend_ingress(frontend, environment, &owner, i)
            })
            .await
            .map_err(|e| Error::reconcile("apply frontend ingress", e))?;
        }

        let config_name = builders::config_name(frontend);
        pass.apply::<ConfigMap>(&namespace, &config_name, CONFIG_SERVICE_COMPONENT, &name, |cm| {
            builders::config_map(frontend, &owner, cm)
        })
        .await
        .map_err(|e| Error::reconcile("apply config map", e))?;

        if let Some(image) = environment.config_service_image() {
            pass.apply::<Deployment>(
                &namespace,
                &config_name,
                CONFIG_SERVICE_COMPONENT,
                &name,
                |d| builders::config_service_deployment(frontend, image, &owner, d),
            )
            .await
            .map_err(|e| Error::reconcile("apply config-service deployment", e))?;
        }

        let shared =
            shared::ensure_for_frontend(&mut pass.cache, environment, &self.config_namespace)
                .await?;
        pass.writes += shared.created();

        Ok(())
    }

    /// Regenerate the API catalog of an environment from all frontends referencing it.
    ///
    /// Every pass in the environment writes the same object. Losing a create or replace to
    /// another pass refetches and recomputes once; losing again leaves the catalog to the
    /// concurrent writer and the next environment pass.
    async fn publish_catalog(
        &self,
        environment: &FrontendEnvironment,
        cache: &mut ObjectCache<'_, C>,
        writes: &mut usize,
    ) -> Result<()> {
        let step = "publish api catalog";
        let env_name = environment.name_any();
        match self.write_catalog(environment, cache, writes).await {
            Err(e) if e.is_write_race() => {
                debug!(
                    environment = %env_name,
                    error = %e,
                    "API catalog written concurrently, retrying"
                );
            }
            other => return other.map_err(|e| Error::reconcile(step, e)),
        }
        match self.write_catalog(environment, cache, writes).await {
            Err(e) if e.is_write_race() => {
                debug!(
                    environment = %env_name,
                    error = %e,
                    "API catalog still contended, skipping"
                );
                Ok(())
            }
            other => other.map_err(|e| Error::reconcile(step, e)),
        }
    }

    async fn write_catalog(
        &self,
        environment: &FrontendEnvironment,
        cache: &mut ObjectCache<'_, C>,
        writes: &mut usize,
    ) -> Result<()> {
        let env_name = environment.name_any();
        let frontends = self.client.list_frontends().await?;
        self.metrics.retain_frontends(
            &frontends
                .iter()
                .map(|f| format!("{}/{}", f.namespace().unwrap_or_default(), f.name_any()))
                .collect(),
        );
        let entries = catalog::build_catalog(&env_name, &frontends);
        let json = catalog::render(&entries)?;
        let owner = shared::environment_owner(environment)?;

        let name = builders::catalog_name(environment);
        let staged = cache
            .fetch_or_init::<ConfigMap>(&self.config_namespace, &name)
            .await?
            .map(|cm| builders::catalog_config_map(&json, &owner, cm));
        let (_, outcome) = cache.commit(staged, API_CATALOG_COMPONENT, &env_name).await?;
        if outcome != CommitOutcome::Unchanged {
            debug!(environment = %env_name, entries = entries.len(), "Published API catalog");
            *writes += 1;
        }
        Ok(())
    }

    async fn write_status(&self, frontend: &Frontend, status: FrontendStatus) -> Result<()> {
        if frontend.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.client.write_frontend_status(frontend, &status).await
    }

    async fn finish_frontend_pass(
        &self,
        frontend: &Frontend,
        pass: Pass<'_, C>,
        result: Result<Option<AggregateStatus>>,
        events: &dyn EventRecorder,
    ) -> Result<PassReport> {
        let prior = frontend.status.as_ref();
        let generation = frontend.metadata.generation;
        let name = frontend.name_any();
        let namespace = frontend.namespace().unwrap_or_default();

        match result {
            Ok(None) => {
                let environment = &frontend.spec.environment;
                info!(environment = %environment, "Environment not found, deferring");
                let pending = status::pending(prior, environment, generation, &now());
                let changed = prior != Some(&pending);
                self.write_status(frontend, pending)
                    .await
                    .map_err(|e| Error::reconcile("write status", e))?;
                if changed {
                    events
                        .publish(
                            &frontend.object_ref(&()),
                            EventType::Normal,
                            reasons::ENVIRONMENT_PENDING,
                            format!("Waiting for FrontendEnvironment {}", environment),
                        )
                        .await;
                }
                self.metrics.pass_finished("Frontend", None);
                Ok(PassReport {
                    state: PassState::Pending,
                    writes: pass.writes,
                    status: None,
                })
            }
            Ok(Some(aggregate)) => {
                let settled = status::settled(prior, aggregate, generation, &now());
                self.write_status(frontend, settled)
                    .await
                    .map_err(|e| Error::reconcile("write status", e))?;
                if pass.writes > 0 {
                    events
                        .publish(
                            &frontend.object_ref(&()),
                            EventType::Normal,
                            reasons::RECONCILED,
                            format!(
                                "Applied {} object(s), {}/{} deployments available",
                                pass.writes, aggregate.ready, aggregate.managed
                            ),
                        )
                        .await;
                }
                self.metrics.pass_finished("Frontend", None);
                self.metrics
                    .frontend_ready(&namespace, &name, aggregate.is_ready());
                info!(
                    writes = pass.writes,
                    managed = aggregate.managed,
                    ready = aggregate.ready,
                    "Frontend settled"
                );
                Ok(PassReport {
                    state: PassState::Settled,
                    writes: pass.writes,
                    status: Some(aggregate),
                })
            }
            Err(err) => {
                warn!(state = ?pass.state, error = %err, "Frontend reconciliation failed");
                let failed = status::failed(prior, &err, generation, &now());
                if let Err(e) = self.write_status(frontend, failed).await {
                    warn!(error = %e, "Failed to record failure on Frontend status");
                }
                events
                    .publish(
                        &frontend.object_ref(&()),
                        EventType::Warning,
                        reasons::RECONCILE_FAILED,
                        err.to_string(),
                    )
                    .await;
                self.metrics
                    .pass_finished("Frontend", Some(err.metric_label()));
                Err(err)
            }
        }
    }

    /// Run one pass for an environment: sync the shared reverse proxy and the API catalog
    pub async fn reconcile_environment(
        &self,
        environment: &FrontendEnvironment,
        span: &Span,
        events: &dyn EventRecorder,
    ) -> Result<PassReport> {
        async {
            let mut cache = ObjectCache::new(&self.client);
            let result = async {
                let mut writes =
                    shared::sync_for_environment(&mut cache, environment, &self.config_namespace)
                        .await?;
                self.publish_catalog(environment, &mut cache, &mut writes)
                    .await?;
                Ok::<_, Error>(writes)
            }
            .await;

            match result {
                Ok(writes) => {
                    self.metrics.pass_finished("FrontendEnvironment", None);
                    if writes > 0 {
                        info!(writes, "Environment synced");
                    }
                    Ok(PassReport {
                        state: PassState::Settled,
                        writes,
                        status: None,
                    })
                }
                Err(err) => {
                    warn!(error = %err, "Environment reconciliation failed");
                    events
                        .publish(
                            &environment.object_ref(&()),
                            EventType::Warning,
                            reasons::RECONCILE_FAILED,
                            err.to_string(),
                        )
                        .await;
                    self.metrics
                        .pass_finished("FrontendEnvironment", Some(err.metric_label()));
                    Err(err)
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}
