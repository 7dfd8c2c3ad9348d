use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use crate::operator::cluster::ClusterClient;
use crate::operator::crd::{Frontend, FrontendCondition, FrontendPhase, FrontendStatus};
use crate::operator::error::{Error, Result};
use crate::operator::labels;

pub const CONDITION_SUCCESSFUL: &str = "ReconciliationSuccessful";
pub const CONDITION_FAILED: &str = "ReconciliationFailed";
pub const CONDITION_READY: &str = "FrontendsReady";

/// Managed versus ready deployment counts of one frontend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStatus {
    pub managed: i32,
    pub ready: i32,
}

impl AggregateStatus {
    pub fn is_ready(&self) -> bool {
        self.managed > 0 && self.managed == self.ready
    }
}

/// A deployment is ready when its `Available` condition is `True`
pub fn deployment_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
}

pub fn owned_by(metadata: &ObjectMeta, uid: &str) -> bool {
    metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

/// Counts the deployments a frontend owns across its namespace and the shared config namespace
pub struct StatusAggregator<'a, C: ClusterClient> {
    client: &'a C,
    config_namespace: &'a str,
}

impl<'a, C: ClusterClient> StatusAggregator<'a, C> {
    pub fn new(client: &'a C, config_namespace: &'a str) -> Self {
        Self {
            client,
            config_namespace,
        }
    }

    fn namespaces(&self, frontend: &Frontend) -> Vec<String> {
        let mut namespaces = Vec::with_capacity(2);
        if let Some(ns) = frontend.namespace() {
            namespaces.push(ns);
        }
        if !namespaces.iter().any(|ns| ns == self.config_namespace) {
            namespaces.push(self.config_namespace.to_string());
        }
        namespaces
    }

    /// Compute the counts; any namespace failing to list fails the whole computation
    pub async fn compute(&self, frontend: &Frontend) -> Result<AggregateStatus> {
        let uid = frontend.uid().ok_or_else(|| {
            Error::InvalidResource(format!("Frontend {} has no uid", frontend.name_any()))
        })?;
        let selector = labels::managed_selector();

        let mut aggregate = AggregateStatus::default();
        for namespace in self.namespaces(frontend) {
            let deployments = self
                .client
                .list::<Deployment>(&namespace, &selector)
                .await
                .map_err(|e| {
                    Error::StatusUnavailable(format!(
                        "listing deployments in namespace {}: {}",
                        namespace, e
                    ))
                })?;

            for deployment in deployments.iter().filter(|d| owned_by(&d.metadata, &uid)) {
                aggregate.managed += 1;
                if deployment_available(deployment) {
                    aggregate.ready += 1;
                }
            }
        }

        debug!(
            frontend = %frontend.name_any(),
            managed = aggregate.managed,
            ready = aggregate.ready,
            "Aggregated status"
        );
        Ok(aggregate)
    }
}

/// Set a condition, moving its transition time only when the status flips
fn set_condition(
    conditions: &mut Vec<FrontendCondition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    now: &str,
) {
    let status = if status { "True" } else { "False" }.to_string();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(now.to_string());
                existing.status = status;
            }
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(FrontendCondition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: Some(now.to_string()),
        }),
    }
}

fn base(prior: Option<&FrontendStatus>, generation: Option<i64>) -> FrontendStatus {
    FrontendStatus {
        observed_generation: generation,
        ..prior.cloned().unwrap_or_default()
    }
}

/// Status after a successful pass; counts are fully overwritten
pub fn settled(
    prior: Option<&FrontendStatus>,
    aggregate: AggregateStatus,
    generation: Option<i64>,
    now: &str,
) -> FrontendStatus {
    let mut status = base(prior, generation);
    status.phase = Some(FrontendPhase::Settled);
    status.managed_deployments = aggregate.managed;
    status.ready_deployments = aggregate.ready;
    status.ready = aggregate.is_ready();

    set_condition(
        &mut status.conditions,
        CONDITION_SUCCESSFUL,
        true,
        "Reconciled",
        "All resources applied".to_string(),
        now,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_FAILED,
        false,
        "Reconciled",
        String::new(),
        now,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        aggregate.is_ready(),
        if aggregate.is_ready() {
            "DeploymentsAvailable"
        } else {
            "DeploymentsUnavailable"
        },
        format!(
            "{}/{} deployments available",
            aggregate.ready, aggregate.managed
        ),
        now,
    );
    status
}

/// Status after a failed pass; the last known counts stay as they were
pub fn failed(
    prior: Option<&FrontendStatus>,
    error: &Error,
    generation: Option<i64>,
    now: &str,
) -> FrontendStatus {
    let mut status = base(prior, generation);
    status.phase = Some(FrontendPhase::Failed);
    set_condition(
        &mut status.conditions,
        CONDITION_FAILED,
        true,
        "ReconcileError",
        error.to_string(),
        now,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_SUCCESSFUL,
        false,
        "ReconcileError",
        String::new(),
        now,
    );
    status
}

/// Status while the referenced environment does not exist
pub fn pending(
    prior: Option<&FrontendStatus>,
    environment: &str,
    generation: Option<i64>,
    now: &str,
) -> FrontendStatus {
    let mut status = base(prior, generation);
    status.phase = Some(FrontendPhase::Pending);
    set_condition(
        &mut status.conditions,
        CONDITION_SUCCESSFUL,
        false,
        "EnvironmentNotFound",
        format!("FrontendEnvironment {} not found", environment),
        now,
    );
    status
}
