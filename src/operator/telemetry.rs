//! Events and metrics emitted by reconciliation passes.
//!
//! Both are injected into the engine. Event publishing is fire-and-forget: a failed
//! event is logged and never fails a pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{info, warn};

pub mod reasons {
    pub const RECONCILED: &str = "Reconciled";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const ENVIRONMENT_PENDING: &str = "EnvironmentPending";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish an event about `regarding`; failures are logged, not returned
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    );
}

/// Creates core/v1 Events through the Kubernetes API
pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) {
        // Events about cluster-scoped objects go to the default namespace
        let namespace = regarding
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let now = Time(chrono::Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}.",
                    regarding.name.as_deref().unwrap_or("unknown")
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: regarding.clone(),
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(type_.as_str().to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Outcome counters and readiness of reconciliation passes
pub trait MetricsSink: Send + Sync {
    /// Record the end of a pass; `failure` is the error label when it failed
    fn pass_finished(&self, kind: &str, failure: Option<&str>);

    /// Record the readiness of a frontend after a settled pass
    fn frontend_ready(&self, namespace: &str, name: &str, ready: bool);

    /// Forget frontends not in `present` (`namespace/name` keys)
    fn retain_frontends(&self, present: &BTreeSet<String>);
}

/// Counters kept in-process and reported through tracing
#[derive(Default)]
pub struct TracingMetrics {
    reconciliations: AtomicU64,
    failures: AtomicU64,
    ready_frontends: Mutex<BTreeMap<String, bool>>,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn ready_count(&self) -> usize {
        self.ready_frontends
            .lock()
            .map(|ready| ready.values().filter(|r| **r).count())
            .unwrap_or_default()
    }
}

impl MetricsSink for TracingMetrics {
    fn pass_finished(&self, kind: &str, failure: Option<&str>) {
        let total = self.reconciliations.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(label) = failure {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            info!(kind, error = label, total, failures, "Reconciliation failed");
        }
    }

    fn frontend_ready(&self, namespace: &str, name: &str, ready: bool) {
        if let Ok(mut frontends) = self.ready_frontends.lock() {
            let key = format!("{}/{}", namespace, name);
            if frontends.insert(key, ready) != Some(ready) {
                let ready_frontends = frontends.values().filter(|r| **r).count();
                info!(namespace, name, ready, ready_frontends, "Frontend readiness changed");
            }
        }
    }

    fn retain_frontends(&self, present: &BTreeSet<String>) {
        if let Ok(mut frontends) = self.ready_frontends.lock() {
            frontends.retain(|key, _| present.contains(key));
        }
    }
}
