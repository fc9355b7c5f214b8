//! Periodic reconciliation.
//!
//! Once the resource type is available, a fresh handler's
//! `check_current_state` runs every reconciliation interval. The first tick
//! fires one full interval after the loop starts, never immediately.

use crate::availability::AvailabilityGate;
use crate::descriptor::ResourceDescriptor;
use crate::error::{ControllerError, is_cancellation};
use crate::handler::HandlerFactory;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs `check_current_state` on a fixed schedule.
pub struct ReconciliationLoop<K> {
    gate: Arc<AvailabilityGate<K>>,
    descriptor: Arc<ResourceDescriptor>,
    factory: Arc<dyn HandlerFactory<K>>,
}

impl<K> fmt::Debug for ReconciliationLoop<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("descriptor", &self.descriptor.display_name())
            .field("interval", &self.descriptor.reconciliation_interval())
            .finish_non_exhaustive()
    }
}

impl<K> ReconciliationLoop<K>
where
    K: Send + Sync + 'static,
{
    /// Creates a loop that waits on `gate` before its first tick.
    pub fn new(
        gate: Arc<AvailabilityGate<K>>,
        descriptor: Arc<ResourceDescriptor>,
        factory: Arc<dyn HandlerFactory<K>>,
    ) -> Self {
        Self {
            gate,
            descriptor,
            factory,
        }
    }

    /// Ticks until `cancel` fires or a reconciliation fails.
    ///
    /// A tick that is still running when the next one is due delays the
    /// schedule; ticks never overlap.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Reconciliation`] for the first failed
    /// `check_current_state`, and [`ControllerError::Transport`] when the
    /// availability check fails with anything but not-found.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let period = self.descriptor.reconciliation_interval();
        info!(
            "Reconciliation loop for {} will run every {:?}",
            self.descriptor.display_name(),
            period
        );

        if !self.gate.wait_until_available(cancel, || {}).await? {
            return Ok(());
        }

        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {}
            }

            debug!("Checking current state of {}", self.descriptor.display_name());
            let handler = self.factory.create();
            match handler.check_current_state(cancel).await {
                Ok(()) => {}
                Err(e) if is_cancellation(&e) => return Ok(()),
                Err(e) => return Err(ControllerError::Reconciliation(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceClient;
    use crate::mock::{HandlerCall, HandlerRecorder, MockResourceClient, widgets};
    use kube::api::DynamicObject;
    use std::time::Duration;

    fn reconciler(
        client: &Arc<MockResourceClient>,
        recorder: &HandlerRecorder,
        interval: Duration,
    ) -> ReconciliationLoop<DynamicObject> {
        let descriptor = widgets().with_reconciliation_interval(interval).unwrap();
        let client: Arc<dyn ResourceClient<DynamicObject>> = client.clone();
        let gate = AvailabilityGate::new(
            client,
            descriptor.clone(),
            Duration::from_millis(200),
            Duration::from_secs(2),
        );
        ReconciliationLoop::new(Arc::new(gate), Arc::new(descriptor), Arc::new(recorder.factory()))
    }

    fn cancel_after(cancel: &CancellationToken, after: Duration) {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            cancel.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(15_500));

        let start = Instant::now();
        reconciler(&client, &recorder, Duration::from_secs(5))
            .run(&cancel)
            .await
            .unwrap();

        let offsets: Vec<Duration> = recorder
            .reconciliations()
            .iter()
            .map(|record| record.started_at - start)
            .collect();
        assert_eq!(
            offsets,
            vec![Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(15)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_handler_per_tick() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(3_500));

        reconciler(&client, &recorder, Duration::from_secs(1))
            .run(&cancel)
            .await
            .unwrap();

        let instances: Vec<usize> = recorder.reconciliations().iter().map(|r| r.instance).collect();
        assert_eq!(instances, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_delays_the_next() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        recorder.delay_reconciliation(Duration::from_secs(7));
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_secs(18));

        let start = Instant::now();
        reconciler(&client, &recorder, Duration::from_secs(5))
            .run(&cancel)
            .await
            .unwrap();

        let offsets: Vec<Duration> = recorder
            .reconciliations()
            .iter()
            .map(|record| record.started_at - start)
            .collect();
        // Second tick is late and runs as soon as the first returns at 12s;
        // cancellation lands while it is still running
        assert_eq!(offsets, vec![Duration::from_secs(5), Duration::from_secs(12)]);
        assert_eq!(recorder.max_active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_fatal() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        recorder.fail_reconciliation("drift detected");

        let err = reconciler(&client, &recorder, Duration::from_secs(5))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Reconciliation(_)));
        assert!(err.to_string().contains("drift detected"));
        assert_eq!(recorder.reconciliations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_cancellation_is_not_a_failure() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        recorder.cancel_reconciliation();

        reconciler(&client, &recorder, Duration::from_secs(5))
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(recorder.calls(), vec![HandlerCall::CheckCurrentState]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_resource_type() {
        let client = Arc::new(MockResourceClient::new());
        client.set_not_found_for(5);
        let recorder = HandlerRecorder::new();
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(6_100));

        let start = Instant::now();
        reconciler(&client, &recorder, Duration::from_secs(5))
            .run(&cancel)
            .await
            .unwrap();

        // Available at 1s, first tick one interval later
        let offsets: Vec<Duration> = recorder
            .reconciliations()
            .iter()
            .map(|record| record.started_at - start)
            .collect();
        assert_eq!(offsets, vec![Duration::from_secs(6)]);
    }
}
