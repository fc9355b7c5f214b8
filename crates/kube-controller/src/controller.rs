//! Controller supervisor.
//!
//! The single entry point of the engine. It waits for the resource type to
//! be served, then runs the watch loop and the reconciliation loop side by
//! side until cancellation or the first fatal failure.

use crate::availability::AvailabilityGate;
use crate::client::ResourceClient;
use crate::config::EngineConfig;
use crate::descriptor::ResourceDescriptor;
use crate::error::ControllerError;
use crate::handler::HandlerFactory;
use crate::reconciler::ReconciliationLoop;
use crate::throttle::LogThrottle;
use crate::watcher::EventWatcher;
use kube::Resource;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One engine instance for one resource type.
pub struct Controller<K> {
    descriptor: Arc<ResourceDescriptor>,
    gate: Arc<AvailabilityGate<K>>,
    watcher: EventWatcher<K>,
    reconciler: ReconciliationLoop<K>,
    config: EngineConfig,
}

impl<K> Controller<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Create a new controller
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        descriptor: ResourceDescriptor,
        factory: impl HandlerFactory<K>,
        config: EngineConfig,
    ) -> Self {
        let factory: Arc<dyn HandlerFactory<K>> = Arc::new(factory);
        let gate = Arc::new(AvailabilityGate::new(
            Arc::clone(&client),
            descriptor.clone(),
            config.availability_poll_interval,
            config.wait_log_throttle,
        ));
        let descriptor = Arc::new(descriptor);

        Self {
            watcher: EventWatcher::new(
                client,
                Arc::clone(&descriptor),
                Arc::clone(&factory),
                config.max_in_flight,
            ),
            reconciler: ReconciliationLoop::new(Arc::clone(&gate), Arc::clone(&descriptor), factory),
            descriptor,
            gate,
            config,
        }
    }

    /// The resource type this controller watches.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Run the controller until `cancel` fires or a subsystem fails
    ///
    /// Cancellation is a graceful stop and yields `Ok(())` once every
    /// in-flight handler has finished.
    ///
    /// # Errors
    ///
    /// The first fatal failure of either subsystem: a transport failure of
    /// the watch or the availability check, or a failed reconciliation.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let resource_name = self.descriptor.display_name();
        info!(
            "=== {} controller STARTED for namespace {} ===",
            resource_name,
            self.descriptor.namespace()
        );

        let result = self.supervise(cancel).await;
        if let Err(e) = &result {
            error!("{} controller exited unexpectedly: {}", resource_name, e);
        }

        info!("=== {} controller TERMINATING ===", resource_name);
        result
    }

    async fn supervise(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let mut waiting_log = LogThrottle::new(self.config.wait_log_throttle);
        let resource_name = self.descriptor.display_name();
        let available = self
            .gate
            .wait_until_available(cancel, || {
                if waiting_log.ready(Instant::now()) {
                    info!("Controller waiting for CRD {}", resource_name);
                }
            })
            .await?;
        if !available {
            return Ok(());
        }

        // Cancelled when either subsystem fails so the other winds down too
        let scope = cancel.child_token();
        let (watched, reconciled) = tokio::join!(
            stop_siblings_on_failure(&scope, self.watcher.run(&scope)),
            stop_siblings_on_failure(&scope, self.reconciler.run(&scope)),
        );
        watched.and(reconciled)
    }
}

impl<K> fmt::Debug for Controller<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("descriptor", &self.descriptor.display_name())
            .field("watcher", &self.watcher)
            .field("reconciler", &self.reconciler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn stop_siblings_on_failure<F>(scope: &CancellationToken, subsystem: F) -> Result<(), ControllerError>
where
    F: Future<Output = Result<(), ControllerError>>,
{
    let result = subsystem.await;
    if result.is_err() {
        scope.cancel();
    }
    result
}
