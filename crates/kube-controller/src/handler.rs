//! Operation handler capability.
//!
//! Integrators implement [`OperationHandler`] for their resource snapshot
//! type. The engine never shares a handler instance between concurrent
//! calls: a [`HandlerFactory`] is asked for a fresh instance for every
//! dispatched event and every reconciliation tick, so handler-local state
//! needs no locking.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Lifecycle operations invoked by the engine.
///
/// Every operation receives the shared cancellation token. Returning
/// [`crate::Cancelled`] reports a cooperative stop; any other error is a
/// failure of that single call.
#[async_trait]
pub trait OperationHandler<K>: Send + Sync {
    /// Called when a new resource is created in the cluster
    async fn on_added(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called when a resource is updated in the cluster
    async fn on_updated(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called when a resource is deleted from the cluster
    async fn on_deleted(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called for BOOKMARK events.
    ///
    /// A bookmark marks that all changes up to a resource version have been
    /// delivered; its snapshot carries little more than
    /// `metadata.resourceVersion`.
    async fn on_bookmarked(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called when the watch reports an error event
    async fn on_error(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called on every reconciliation tick to compare actual and desired state
    async fn check_current_state(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Produces a fresh [`OperationHandler`] per event and per tick.
///
/// Any `Fn() -> H` closure is a factory:
///
/// ```ignore
/// let factory = move || WidgetOperationHandler::new(client.clone());
/// ```
pub trait HandlerFactory<K>: Send + Sync + 'static {
    fn create(&self) -> Box<dyn OperationHandler<K>>;
}

impl<K, F, H> HandlerFactory<K> for F
where
    F: Fn() -> H + Send + Sync + 'static,
    H: OperationHandler<K> + 'static,
{
    fn create(&self) -> Box<dyn OperationHandler<K>> {
        Box::new(self())
    }
}
