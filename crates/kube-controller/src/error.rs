//! Engine error types.
//!
//! This module defines the failure taxonomy of the watch/dispatch/reconcile
//! engine. Only [`ControllerError`] ever leaves [`crate::Controller::run`];
//! the other types are recovered from (or classified) inside the engine.

use thiserror::Error;

/// Errors that terminate a controller instance, or prevent it from starting.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A resource descriptor field was blank or out of range
    #[error("Invalid resource descriptor: {0}")]
    InvalidDescriptor(String),

    /// Invalid process configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The API server transport failed (watch broke, or a non-404 list failure)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// `check_current_state` failed
    #[error("Reconciliation failed: {0:#}")]
    Reconciliation(#[source] anyhow::Error),

    /// A background task could not be joined
    #[error("Background task failed: {0}")]
    Watch(String),
}

/// Errors produced by a [`crate::ResourceClient`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The resource type is not registered on the API server
    #[error("Resource type not found: {0}")]
    NotFound(String),

    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A single object could not be decoded into the snapshot type
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The streaming connection failed
    #[error("Watch stream error: {0}")]
    Stream(String),

    /// The watch stream ended without being asked to
    #[error("Watch stream ended unexpectedly")]
    Closed,
}

impl TransportError {
    /// Whether this is the recoverable "resource type not registered" class.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether only one event was lost and the stream itself is intact.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Errors raised while routing a single event to its handler operation.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The event kind has no handler operation
    #[error("Unknown event type received: {0}")]
    UnknownEventKind(String),

    /// The handler operation failed
    #[error("Handler failed: {0:#}")]
    Handler(#[source] anyhow::Error),
}

/// Marker error a handler returns when it stopped because of cancellation.
///
/// Every layer treats it as a graceful stop rather than a failure:
///
/// ```
/// # use kube_controller::Cancelled;
/// # use tokio_util::sync::CancellationToken;
/// fn step(cancel: &CancellationToken) -> anyhow::Result<()> {
///     if cancel.is_cancelled() {
///         return Err(Cancelled.into());
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Whether a handler error is the [`Cancelled`] marker.
#[must_use]
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.is::<Cancelled>()
}
