//! Engine configuration.
//!
//! These are engine-wide constants, not per-resource settings; the
//! per-resource reconciliation interval lives on the
//! [`crate::ResourceDescriptor`].

use std::num::NonZeroUsize;
use std::time::Duration;

/// How often the availability gate is polled while the resource type is missing.
pub const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum spacing of repeated "waiting for resource type" diagnostics.
pub const WAIT_LOG_THROTTLE: Duration = Duration::from_secs(2);

/// Tunables shared by every subsystem of one controller instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Delay between availability checks while the resource type is missing.
    pub availability_poll_interval: Duration,
    /// Window of the "waiting for resource type" log throttle.
    pub wait_log_throttle: Duration,
    /// Upper bound on concurrently running event handlers.
    ///
    /// `None` keeps admission unbounded. With a cap, the watch loop stops
    /// reading from the stream until a running handler finishes.
    pub max_in_flight: Option<NonZeroUsize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            availability_poll_interval: AVAILABILITY_POLL_INTERVAL,
            wait_log_throttle: WAIT_LOG_THROTTLE,
            max_in_flight: None,
        }
    }
}

impl EngineConfig {
    /// Caps concurrently running event handlers.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: NonZeroUsize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }
}
