//! Watch loop.
//!
//! Opens one watch stream and hands every event to the [`EventDispatcher`]
//! without waiting for the handler. The loop ends on cancellation or on the
//! first unrecoverable transport failure; in both cases it waits for every
//! in-flight handler before returning.

use crate::client::ResourceClient;
use crate::descriptor::ResourceDescriptor;
use crate::dispatcher::EventDispatcher;
use crate::error::{ControllerError, TransportError};
use crate::handler::HandlerFactory;
use futures::StreamExt;
use kube::Resource;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives watch events for one resource type.
pub struct EventWatcher<K> {
    client: Arc<dyn ResourceClient<K>>,
    descriptor: Arc<ResourceDescriptor>,
    factory: Arc<dyn HandlerFactory<K>>,
    max_in_flight: Option<NonZeroUsize>,
}

impl<K> EventWatcher<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        descriptor: Arc<ResourceDescriptor>,
        factory: Arc<dyn HandlerFactory<K>>,
        max_in_flight: Option<NonZeroUsize>,
    ) -> Self {
        Self {
            client,
            descriptor,
            factory,
            max_in_flight,
        }
    }

    /// Watches until `cancel` fires or the stream fails.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Transport`] when the watch cannot be opened, breaks,
    /// or ends. Returns only after every handler it started has finished.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let mut dispatcher = EventDispatcher::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.descriptor),
            self.max_in_flight,
        );

        let result = self.receive(&mut dispatcher, cancel).await;

        if cancel.is_cancelled() && dispatcher.in_flight() > 0 {
            info!(
                "Cancellation signal received. Waiting for {} event handler(s) of {} to finish",
                dispatcher.in_flight(),
                self.descriptor.display_name()
            );
        }
        dispatcher.drain().await;

        result.map_err(|e| self.on_error(e))
    }

    async fn receive(
        &self,
        dispatcher: &mut EventDispatcher<K>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            opened = self.client.watch(&self.descriptor) => opened?,
        };
        info!("Watching {}", self.descriptor);

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                item = stream.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) if e.is_decode() => {
                    warn!("Skipping undecodable watch event for {}: {}", self.descriptor.display_name(), e);
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None if cancel.is_cancelled() => return Ok(()),
                None => return Err(TransportError::Closed),
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Dropping {} event received during shutdown", event.kind);
                    return Ok(());
                }
                () = dispatcher.ready() => {}
            }
            dispatcher.dispatch(event, cancel);
        }
    }

    fn on_error(&self, e: TransportError) -> ControllerError {
        error!(
            "Resource watcher for {} failed with an unrecoverable error: {}",
            self.descriptor.display_name(),
            e
        );
        ControllerError::Transport(e)
    }
}

impl<K> fmt::Debug for EventWatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWatcher")
            .field("descriptor", &self.descriptor.display_name())
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WatchEvent;
    use crate::mock::{HandlerCall, HandlerRecorder, MockResourceClient, widget, widgets};
    use kube::api::DynamicObject;
    use std::time::Duration;

    fn watcher(client: &Arc<MockResourceClient>, recorder: &HandlerRecorder) -> EventWatcher<DynamicObject> {
        let client: Arc<dyn ResourceClient<DynamicObject>> = client.clone();
        EventWatcher::new(client, Arc::new(widgets()), Arc::new(recorder.factory()), None)
    }

    #[tokio::test]
    async fn test_stream_end_is_an_error() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        let feed = client.watch_feed();
        feed.send(WatchEvent::added(widget("w1")));
        drop(feed);

        let err = watcher(&client, &recorder)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Transport(TransportError::Closed)));
        assert_eq!(recorder.completed(), vec![HandlerCall::Added("w1".to_string())]);
    }

    #[tokio::test]
    async fn test_decode_errors_are_skipped() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        let feed = client.watch_feed();
        let bad = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        feed.fail(TransportError::Decode(bad));
        feed.send(WatchEvent::modified(widget("w1")));
        feed.fail(TransportError::Stream("connection reset".to_string()));

        let err = watcher(&client, &recorder)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Transport(TransportError::Stream(_))));
        assert_eq!(recorder.completed(), vec![HandlerCall::Updated("w1".to_string())]);
        drop(feed);
    }

    #[tokio::test]
    async fn test_watch_open_failure_is_fatal() {
        let client = Arc::new(MockResourceClient::new());
        client.fail_watch_with("forbidden");
        let recorder = HandlerRecorder::new();

        let err = watcher(&client, &recorder)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Transport(TransportError::Stream(msg)) if msg == "forbidden"));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_drains_in_flight_handlers() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        recorder.delay("slow", Duration::from_secs(3));
        let feed = client.watch_feed();
        for _ in 0..3 {
            feed.send(WatchEvent::added(widget("slow")));
        }

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let start = tokio::time::Instant::now();
        watcher(&client, &recorder).run(&cancel).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(recorder.completed().len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
        drop(feed);
    }

    #[tokio::test]
    async fn test_cancelled_before_open() {
        let client = Arc::new(MockResourceClient::new());
        let recorder = HandlerRecorder::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        watcher(&client, &recorder).run(&cancel).await.unwrap();

        assert!(client.watches_opened().is_empty());
    }
}
