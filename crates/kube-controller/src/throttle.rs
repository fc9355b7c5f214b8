//! Rate limiting for repetitive diagnostics.

use std::time::Duration;
use tokio::time::Instant;

/// Lets a message through at most once per window.
///
/// Owned by whichever component emits the message, so separate controller
/// instances never share throttle state.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    window: Duration,
    last_emitted: Option<Instant>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: None,
        }
    }

    /// Returns `true` (and records `now`) when the window has passed since
    /// the last emission. The first call always passes.
    pub fn ready(&mut self, now: Instant) -> bool {
        let ready = self
            .last_emitted
            .is_none_or(|last| now.saturating_duration_since(last) >= self.window);
        if ready {
            self.last_emitted = Some(now);
        }
        ready
    }
}
