//! kube-runtime controllers driving the engine.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, info_span, warn};

use crate::operator::cluster::KubeCluster;
use crate::operator::crd::{Frontend, FrontendEnvironment};
use crate::operator::engine::Engine;
use crate::operator::error::Error;
use crate::operator::labels;
use crate::operator::settings::{OperatorSettings, Settings};
use crate::operator::telemetry::{KubeEventRecorder, TracingMetrics};

/// Shared state handed to every reconcile call
pub struct Context {
    pub engine: Engine<KubeCluster>,
    pub events: KubeEventRecorder,
    pub settings: OperatorSettings,
}

async fn reconcile_frontend(frontend: Arc<Frontend>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = info_span!(
        "reconcile_frontend",
        frontend = %frontend.name_any(),
        namespace = %frontend.namespace().unwrap_or_default(),
    );
    ctx.engine
        .reconcile_frontend(&frontend, &span, &ctx.events)
        .await?;
    Ok(Action::requeue(ctx.settings.requeue_interval()))
}

fn frontend_error_policy(frontend: Arc<Frontend>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        frontend = %frontend.name_any(),
        namespace = %frontend.namespace().unwrap_or_default(),
        %error,
        "Reconcile error, requeuing"
    );
    Action::requeue(ctx.settings.error_requeue())
}

async fn reconcile_environment(
    environment: Arc<FrontendEnvironment>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let span = info_span!("reconcile_environment", environment = %environment.name_any());
    ctx.engine
        .reconcile_environment(&environment, &span, &ctx.events)
        .await?;
    Ok(Action::requeue(ctx.settings.requeue_interval()))
}

fn environment_error_policy(
    environment: Arc<FrontendEnvironment>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!(environment = %environment.name_any(), %error, "Reconcile error, requeuing");
    Action::requeue(ctx.settings.error_requeue())
}

/// Build a kube client from an explicit kubeconfig path, or infer one
async fn kube_client(kubeconfig: Option<&str>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?
        }
        // In-cluster or ~/.kube/config
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

/// Run the Frontend and FrontendEnvironment controllers until a shutdown signal
pub async fn run(settings: Settings) -> Result<()> {
    // Install default CryptoProvider for rustls (required for kube-rs HTTPS connections)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let client = kube_client(settings.kubeconfig.as_deref()).await?;
    let operator = settings.operator.clone();
    let config_namespace = operator.config_namespace.clone();

    let cluster = KubeCluster::new(
        client.clone(),
        operator.field_manager.clone(),
        operator.api_timeout(),
    );
    let metrics = Arc::new(TracingMetrics::new());
    let ctx = Arc::new(Context {
        engine: Engine::new(cluster, &config_namespace, metrics.clone()),
        events: KubeEventRecorder::new(client.clone(), operator.field_manager.clone()),
        settings: operator,
    });

    let managed = watcher::Config::default().labels(&labels::managed_selector());

    let frontends: Api<Frontend> = Api::all(client.clone());
    let environments: Api<FrontendEnvironment> = Api::all(client.clone());

    let frontend_controller = Controller::new(frontends, watcher::Config::default());
    let frontend_store = frontend_controller.store();
    let frontend_controller = frontend_controller
        .owns(Api::<Deployment>::all(client.clone()), managed.clone())
        .owns(Api::<Service>::all(client.clone()), managed.clone())
        .owns(Api::<Ingress>::all(client.clone()), managed.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), managed.clone())
        // Environment changes affect every frontend running in it
        .watches(environments.clone(), watcher::Config::default(), move |env| {
            let name = env.name_any();
            frontend_store
                .state()
                .into_iter()
                .filter(|frontend| frontend.spec.environment == name)
                .map(|frontend| ObjectRef::from_obj(&*frontend))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_frontend, frontend_error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!(frontend = %object.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Frontend controller error"),
            }
        });

    let environment_controller = Controller::new(environments, watcher::Config::default())
        .owns(
            Api::<Deployment>::namespaced(client.clone(), &config_namespace),
            managed.clone(),
        )
        .owns(
            Api::<Service>::namespaced(client.clone(), &config_namespace),
            managed.clone(),
        )
        .owns(
            Api::<ConfigMap>::namespaced(client.clone(), &config_namespace),
            managed,
        )
        .shutdown_on_signal()
        .run(reconcile_environment, environment_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!(environment = %object.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Environment controller error"),
            }
        });

    info!(config_namespace = %config_namespace, "Starting frontend operator controllers");
    futures::join!(frontend_controller, environment_controller);
    info!(
        reconciliations = metrics.reconciliations(),
        failures = metrics.failures(),
        ready_frontends = metrics.ready_count(),
        "Frontend operator shutdown complete"
    );
    Ok(())
}
