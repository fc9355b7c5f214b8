//! Kube Controller
//!
//! A watch/dispatch/reconcile engine for Kubernetes custom resources.
//!
//! One [`Controller`] serves one resource type. It waits until the API
//! server serves the type, then runs two subsystems side by side:
//!
//! - an [`EventWatcher`] that streams watch events and hands each one to a
//!   fresh [`OperationHandler`] on its own task;
//! - a [`ReconciliationLoop`] that calls `check_current_state` on a fresh
//!   handler once per reconciliation interval.
//!
//! Handler failures for single events are logged and contained. Transport
//! and reconciliation failures end the controller; cancellation drains every
//! in-flight handler and returns `Ok(())`.

pub mod availability;
pub mod client;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod kube_client;
pub mod reconciler;
pub mod throttle;
pub mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use availability::AvailabilityGate;
pub use client::{ResourceClient, WatchEventStream};
pub use config::EngineConfig;
pub use controller::Controller;
pub use descriptor::{DEFAULT_RECONCILIATION_INTERVAL, ResourceDescriptor};
pub use dispatcher::{EventDispatcher, InFlightSet};
pub use error::{Cancelled, ControllerError, DispatchError, TransportError, is_cancellation};
pub use event::{WatchEvent, WatchEventKind};
pub use handler::{HandlerFactory, OperationHandler};
pub use kube_client::KubeResourceClient;
pub use reconciler::ReconciliationLoop;
pub use throttle::LogThrottle;
pub use watcher::EventWatcher;
