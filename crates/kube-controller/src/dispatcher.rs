//! Event dispatch.
//!
//! Each watch event is routed to the matching handler operation on its own
//! task, served by a freshly created handler instance. The dispatcher keeps
//! the running tasks in an [`InFlightSet`] so the watch loop can drain them
//! before it returns.

use crate::descriptor::ResourceDescriptor;
use crate::error::{DispatchError, is_cancellation};
use crate::event::{WatchEvent, WatchEventKind};
use crate::handler::{HandlerFactory, OperationHandler};
use kube::{Resource, ResourceExt};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handler tasks that have been admitted and not yet reaped.
///
/// Only the watch loop touches it, so it needs no synchronization even
/// though the tasks themselves run in parallel.
#[derive(Debug, Default)]
pub struct InFlightSet {
    tasks: JoinSet<()>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked tasks, finished-but-unpruned ones included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes every task that has already completed.
    pub fn prune(&mut self) -> usize {
        let mut pruned = 0;
        while let Some(result) = self.tasks.try_join_next() {
            report(result);
            pruned += 1;
        }
        pruned
    }

    /// Waits for one task to complete; `false` if the set was empty.
    pub async fn join_one(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(result) => {
                report(result);
                true
            }
            None => false,
        }
    }

    /// Waits for every tracked task to complete.
    pub async fn drain(&mut self) {
        while self.join_one().await {}
    }

    fn spawn<F>(&mut self, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task)
    }
}

fn report(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Event handler task did not complete: {}", e);
    }
}

/// Routes watch events to handler operations.
pub struct EventDispatcher<K> {
    factory: Arc<dyn HandlerFactory<K>>,
    descriptor: Arc<ResourceDescriptor>,
    max_in_flight: Option<NonZeroUsize>,
    in_flight: InFlightSet,
}

impl<K> EventDispatcher<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Creates a dispatcher; `max_in_flight` caps concurrently running handlers.
    pub fn new(
        factory: Arc<dyn HandlerFactory<K>>,
        descriptor: Arc<ResourceDescriptor>,
        max_in_flight: Option<NonZeroUsize>,
    ) -> Self {
        Self {
            factory,
            descriptor,
            max_in_flight,
            in_flight: InFlightSet::new(),
        }
    }

    /// Resolves once another event may be admitted.
    ///
    /// Immediate when no cap is configured. Cancel safe.
    pub async fn ready(&mut self) {
        self.in_flight.prune();
        let Some(cap) = self.max_in_flight else {
            return;
        };
        while self.in_flight.len() >= cap.get() {
            if !self.in_flight.join_one().await {
                break;
            }
        }
    }

    /// Starts handling `event` on its own task and returns without waiting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&mut self, event: WatchEvent<K>, cancel: &CancellationToken) -> AbortHandle {
        self.in_flight.prune();

        let handler = self.factory.create();
        let descriptor = Arc::clone(&self.descriptor);
        let cancel = cancel.clone();
        self.in_flight.spawn(async move {
            handle_event(handler.as_ref(), &descriptor, &event, &cancel).await;
        })
    }

    /// Number of admitted tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits for every admitted handler task to finish.
    pub async fn drain(&mut self) {
        self.in_flight.drain().await;
    }
}

impl<K> fmt::Debug for EventDispatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("descriptor", &self.descriptor.display_name())
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

/// Handles one event, logging instead of propagating every failure.
pub async fn handle_event<K: Resource>(
    handler: &dyn OperationHandler<K>,
    descriptor: &ResourceDescriptor,
    event: &WatchEvent<K>,
    cancel: &CancellationToken,
) {
    let name = event.resource.name_any();
    let namespace = event.resource.namespace().unwrap_or_default();

    info!(
        "Controller received event {} {}/{}: {}/{}",
        event.kind,
        descriptor.group(),
        descriptor.singular(),
        namespace,
        name
    );

    match execute(handler, event, cancel).await {
        Ok(()) => {}
        Err(DispatchError::UnknownEventKind(kind)) => {
            warn!("Skipping event {} for {}/{}", kind, namespace, name);
        }
        Err(DispatchError::Handler(e)) if is_cancellation(&e) => {
            debug!("{} call of {} stopped by cancellation", event.kind, name);
        }
        Err(DispatchError::Handler(e)) => {
            error!(
                "An error occurred on the {} call of {}/{} ({}): {:#}",
                event.kind,
                namespace,
                name,
                descriptor.singular(),
                e
            );
        }
    }
}

/// Invokes the handler operation matching the event kind.
///
/// # Errors
///
/// [`DispatchError::UnknownEventKind`] for kinds without an operation, and
/// [`DispatchError::Handler`] when the operation itself fails.
pub async fn execute<K>(
    handler: &dyn OperationHandler<K>,
    event: &WatchEvent<K>,
    cancel: &CancellationToken,
) -> Result<(), DispatchError> {
    let resource = &event.resource;
    let result = match &event.kind {
        WatchEventKind::Added => handler.on_added(resource, cancel).await,
        WatchEventKind::Modified => handler.on_updated(resource, cancel).await,
        WatchEventKind::Deleted => handler.on_deleted(resource, cancel).await,
        WatchEventKind::Bookmark => handler.on_bookmarked(resource, cancel).await,
        WatchEventKind::Error => handler.on_error(resource, cancel).await,
        WatchEventKind::Unknown(kind) => return Err(DispatchError::UnknownEventKind(kind.clone())),
    };
    result.map_err(DispatchError::Handler)
}
