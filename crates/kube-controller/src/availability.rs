//! Resource type availability gate.
//!
//! Watching or reconciling only makes sense once the API server serves the
//! resource type. The gate answers that with a single list request.

use crate::client::ResourceClient;
use crate::descriptor::ResourceDescriptor;
use crate::error::TransportError;
use crate::throttle::LogThrottle;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Checks whether the watched resource type is registered.
pub struct AvailabilityGate<K> {
    client: Arc<dyn ResourceClient<K>>,
    descriptor: ResourceDescriptor,
    poll_interval: Duration,
    not_found_log: Mutex<LogThrottle>,
}

impl<K> fmt::Debug for AvailabilityGate<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailabilityGate")
            .field("descriptor", &self.descriptor.display_name())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<K> AvailabilityGate<K> {
    /// Creates a gate polled every `poll_interval` while waiting; `log_window`
    /// rate-limits the not-found diagnostic.
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        descriptor: ResourceDescriptor,
        poll_interval: Duration,
        log_window: Duration,
    ) -> Self {
        Self {
            client,
            descriptor,
            poll_interval,
            not_found_log: Mutex::new(LogThrottle::new(log_window)),
        }
    }

    /// Issues one list request for the resource type.
    ///
    /// Returns `Ok(false)` when the type is not registered and `Ok(true)` on
    /// any successful list, empty or not.
    ///
    /// # Errors
    ///
    /// Any failure other than not-found is returned unchanged; the caller
    /// treats it as fatal.
    pub async fn check_available(&self) -> Result<bool, TransportError> {
        match self.client.list(&self.descriptor).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                self.log_not_found();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Polls until the resource type is available or `cancel` fires.
    ///
    /// Returns `Ok(true)` once available and `Ok(false)` when cancelled first.
    /// `on_pending` runs after every negative check.
    ///
    /// # Errors
    ///
    /// Returns the first non-404 failure of [`Self::check_available`].
    pub async fn wait_until_available<F>(
        &self,
        cancel: &CancellationToken,
        mut on_pending: F,
    ) -> Result<bool, TransportError>
    where
        F: FnMut(),
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if self.check_available().await? {
                return Ok(true);
            }
            on_pending();

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(false),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn log_not_found(&self) {
        let ready = self
            .not_found_log
            .lock()
            .map(|mut throttle| throttle.ready(Instant::now()))
            .unwrap_or(true);
        if !ready {
            return;
        }

        warn!(
            "No CustomResourceDefinition found for {}, group {} and version {} on namespace {}.",
            self.descriptor.plural(),
            self.descriptor.group(),
            self.descriptor.version(),
            self.descriptor.namespace()
        );
        info!("Checking again in {:?}...", self.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResourceClient, widget, widgets};

    fn gate(client: &Arc<MockResourceClient>) -> AvailabilityGate<kube::api::DynamicObject> {
        let client: Arc<dyn ResourceClient<_>> = client.clone();
        AvailabilityGate::new(client, widgets(), Duration::from_millis(200), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error() {
        let client = Arc::new(MockResourceClient::new());
        client.set_not_found(true);

        assert!(!gate(&client).check_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_list_is_available() {
        let client = Arc::new(MockResourceClient::new());

        assert!(gate(&client).check_available().await.unwrap());
        assert_eq!(client.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_populated_list_is_available() {
        let client = Arc::new(MockResourceClient::new());
        client.set_objects(vec![widget("w1"), widget("w2")]);

        assert!(gate(&client).check_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_other_failures_propagate() {
        let client = Arc::new(MockResourceClient::new());
        client.fail_list_with("connection refused");

        let err = gate(&client).check_available().await.unwrap_err();
        assert!(matches!(err, TransportError::Stream(msg) if msg == "connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_registered() {
        let client = Arc::new(MockResourceClient::new());
        client.set_not_found_for(3);
        let gate = gate(&client);
        let start = Instant::now();
        let mut pending = 0;

        let available = gate
            .wait_until_available(&CancellationToken::new(), || pending += 1)
            .await
            .unwrap();

        assert!(available);
        assert_eq!(pending, 3);
        assert_eq!(client.list_calls(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stops_on_cancellation() {
        let client = Arc::new(MockResourceClient::new());
        client.set_not_found(true);
        let gate = gate(&client);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            })
        };

        assert!(!gate.wait_until_available(&cancel, || {}).await.unwrap());
        canceller.await.unwrap();
        // Polls at 0, 200 and 400ms
        assert_eq!(client.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_becomes_available_once_registered() {
        let client = Arc::new(MockResourceClient::new());
        client.set_not_found(true);
        let gate = gate(&client);

        assert!(!gate.check_available().await.unwrap());
        assert!(!gate.check_available().await.unwrap());
        client.set_not_found(false);
        assert!(gate.check_available().await.unwrap());
        assert_eq!(client.list_calls(), 3);
    }
}
