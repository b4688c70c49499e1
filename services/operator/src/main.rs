//! keepalived operator
//!
//! Watches `KeepalivedGroup` resources and the services that reference
//! them, assigns each VRRP instance a stable router id, and renders the
//! keepalived configuration and daemonset for every group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Service};
use keepalived_api::{KeepalivedGroup, GROUP_POD_LABEL};
use keepalived_operator::config::{Config, OperatorContext};
use keepalived_operator::controller::Controller;
use keepalived_operator::queue::WorkQueue;
use keepalived_operator::render::TemplateRenderer;
use keepalived_operator::routing::{
    AnnotatedServicePredicate, GroupChangePredicate, GroupRouter, KeepalivedPodPredicate,
    PodRouter, ServiceRouter, Trigger,
};
use keepalived_operator::store::cluster::{supports_pod_monitors, KubeStore};
use keepalived_operator::watch::run_watch;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting keepalived operator");
    info!(
        template_file = %config.template_file.display(),
        image = %config.image,
        workers = config.workers,
        "Configuration loaded"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let supports_pod_monitor = supports_pod_monitors(&client).await;
    let renderer = TemplateRenderer::from_file(&config.template_file)
        .context("Failed to load keepalived template")?;

    let context = Arc::new(OperatorContext::new(config.clone(), supports_pod_monitor));
    let store = Arc::new(KubeStore::new(client.clone()));
    let controller = Arc::new(Controller::new(store, Arc::new(renderer), context));
    let queue = WorkQueue::new();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut watches = Vec::new();
    watches.push(tokio::spawn(run_watch(
        "KeepalivedGroup",
        Api::<KeepalivedGroup>::all(client.clone()),
        watcher::Config::default(),
        Trigger::new(GroupChangePredicate, GroupRouter),
        queue.clone(),
        shutdown_rx.clone(),
    )));
    watches.push(tokio::spawn(run_watch(
        "Service",
        Api::<Service>::all(client.clone()),
        watcher::Config::default(),
        Trigger::new(AnnotatedServicePredicate, ServiceRouter),
        queue.clone(),
        shutdown_rx.clone(),
    )));
    watches.push(tokio::spawn(run_watch(
        "Pod",
        Api::<Pod>::all(client.clone()),
        watcher::Config::default().labels(GROUP_POD_LABEL),
        Trigger::new(KeepalivedPodPredicate, PodRouter),
        queue.clone(),
        shutdown_rx.clone(),
    )));

    let mut controller_handle = tokio::spawn({
        let queue = queue.clone();
        let shutdown_rx = shutdown_rx.clone();
        let workers = config.workers;
        async move { controller.run(queue, workers, shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to shut down...");
    let drain = async {
        for handle in watches {
            let _ = handle.await;
        }
        if !controller_handle.is_finished() {
            let _ = controller_handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        error!("Timed out waiting for tasks to shut down");
    }

    info!("Keepalived operator shutdown complete");
    Ok(())
}
