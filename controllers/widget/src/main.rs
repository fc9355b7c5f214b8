//! Widget Controller
//!
//! Watches `Widget` resources in one namespace and periodically checks
//! their current state, using the kube-controller engine.

mod config;
mod handler;

use crate::config::Config;
use crate::handler::WidgetOperationHandler;
use anyhow::Context;
use crds::Widget;
use kube::{Api, Client, Resource};
use kube_controller::{
    Controller, ControllerError, EngineConfig, KubeResourceClient, ResourceClient, ResourceDescriptor,
};
use std::future::{Future, pending};
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Widget Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Reconciliation interval: {:?}", config.reconciliation_interval);
    info!("  Shutdown timeout: {:?}", config.shutdown_timeout);
    info!(
        "  Max in-flight handlers: {}",
        config
            .max_in_flight
            .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
    );

    let descriptor = ResourceDescriptor::new(
        Widget::group(&()),
        Widget::version(&()),
        Widget::plural(&()),
        "widget",
        config.namespace.as_str(),
    )?
    .with_reconciliation_interval(config.reconciliation_interval)?;

    let mut engine_config = EngineConfig::default();
    if let Some(max_in_flight) = config.max_in_flight {
        engine_config = engine_config.with_max_in_flight(max_in_flight);
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let transport: Arc<dyn ResourceClient<Widget>> = Arc::new(KubeResourceClient::new(client.clone()));

    let api: Api<Widget> = Api::namespaced(client, &config.namespace);
    let handler_descriptor = Arc::new(descriptor.clone());
    let factory = move || WidgetOperationHandler::new(api.clone(), Arc::clone(&handler_descriptor));

    let controller = Controller::new(transport, descriptor, factory, engine_config);

    // Installed before the controller starts so a failure aborts start-up
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut task = tokio::spawn(async move { controller.run(&token).await });

    tokio::select! {
        result = &mut task => return finish(result),
        received = first_signal(tokio::signal::ctrl_c(), terminate.recv()) => info!("Received {}", received),
    }

    info!(
        "Shutting down; waiting up to {:?} for in-flight handlers",
        config.shutdown_timeout
    );
    cancel.cancel();

    if let Ok(result) = tokio::time::timeout(config.shutdown_timeout, &mut task).await {
        finish(result)
    } else {
        warn!(
            "Event handlers still running after {:?}; exiting anyway",
            config.shutdown_timeout
        );
        task.abort();
        Ok(())
    }
}

/// Resolves with the name of the first shutdown signal received.
///
/// A listener that fails is logged and then ignored, so a broken SIGINT
/// listener never stops the controller on its own.
async fn first_signal(
    interrupt: impl Future<Output = io::Result<()>>,
    terminate: impl Future<Output = Option<()>>,
) -> &'static str {
    let interrupt = async {
        if let Err(e) = interrupt.await {
            error!("Failed to listen for SIGINT: {}", e);
            pending::<()>().await;
        }
    };
    let terminate = async {
        if terminate.await.is_none() {
            error!("SIGTERM listener closed");
            pending::<()>().await;
        }
    };

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

fn finish(result: Result<Result<(), ControllerError>, JoinError>) -> anyhow::Result<()> {
    Ok(result.context("Controller task failed to complete")??)
}
