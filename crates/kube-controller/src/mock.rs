//! Mock transport and handlers for unit testing
//!
//! This module provides an in-memory [`ResourceClient`] and a recording
//! [`OperationHandler`] factory so the engine can be exercised without an
//! API server. Snapshots are [`DynamicObject`]s of the `Widget` type
//! (`widgets.example.io/v1alpha1`).

use crate::client::{ResourceClient, WatchEventStream};
use crate::descriptor::ResourceDescriptor;
use crate::error::{Cancelled, TransportError};
use crate::event::WatchEvent;
use crate::handler::OperationHandler;
use async_trait::async_trait;
use futures::StreamExt;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type FeedItem = Result<WatchEvent<DynamicObject>, TransportError>;

/// Descriptor for `widgets.example.io/v1alpha1` in `default`.
pub fn widgets() -> ResourceDescriptor {
    ResourceDescriptor::new("example.io", "v1alpha1", "widgets", "widget", "default")
        .unwrap()
}

/// A `Widget` snapshot named `name` in `default`.
pub fn widget(name: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("example.io", "v1alpha1", "Widget"),
        "widgets",
    );
    DynamicObject::new(name, &ar).within("default")
}

/// Mock resource client
///
/// Availability is scripted through the list call; the watch stream is fed
/// through the [`WatchFeed`] returned by [`MockResourceClient::watch_feed`].
#[derive(Debug)]
pub struct MockResourceClient {
    objects: Mutex<Vec<DynamicObject>>,
    // Remaining list calls answered with NotFound; usize::MAX means forever
    not_found_remaining: AtomicUsize,
    list_failure: Mutex<Option<String>>,
    watch_failure: Mutex<Option<String>>,
    list_calls: AtomicUsize,
    watch_opened_at: Mutex<Vec<Instant>>,
    feed: Mutex<Option<mpsc::UnboundedSender<FeedItem>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<FeedItem>>>,
}

impl Default for MockResourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceClient {
    /// Create a new mock client serving an empty, available resource type
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            objects: Mutex::new(Vec::new()),
            not_found_remaining: AtomicUsize::new(0),
            list_failure: Mutex::new(None),
            watch_failure: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            watch_opened_at: Mutex::new(Vec::new()),
            feed: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Report the resource type as unregistered until switched back
    pub fn set_not_found(&self, not_found: bool) {
        let remaining = if not_found { usize::MAX } else { 0 };
        self.not_found_remaining.store(remaining, Ordering::SeqCst);
    }

    /// Report the resource type as unregistered for the next `calls` list calls
    pub fn set_not_found_for(&self, calls: usize) {
        self.not_found_remaining.store(calls, Ordering::SeqCst);
    }

    /// Objects returned by list
    pub fn set_objects(&self, objects: Vec<DynamicObject>) {
        *self.objects.lock().unwrap() = objects;
    }

    /// Fail every list call with a non-404 error
    pub fn fail_list_with(&self, message: &str) {
        *self.list_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Fail opening the watch with a non-404 error
    pub fn fail_watch_with(&self, message: &str) {
        *self.watch_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Take the sending side of the watch stream.
    ///
    /// The stream ends once the feed is dropped.
    pub fn watch_feed(&self) -> WatchFeed {
        let sender = self.feed.lock().unwrap().take().unwrap();
        WatchFeed { sender }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Instants at which a watch was opened
    pub fn watches_opened(&self) -> Vec<Instant> {
        self.watch_opened_at.lock().unwrap().clone()
    }

    fn not_found(&self) -> bool {
        self.not_found_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl ResourceClient<DynamicObject> for MockResourceClient {
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<Vec<DynamicObject>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.not_found() {
            return Err(TransportError::NotFound(descriptor.display_name()));
        }
        if let Some(message) = self.list_failure.lock().unwrap().clone() {
            return Err(TransportError::Stream(message));
        }
        Ok(self.objects.lock().unwrap().clone())
    }

    async fn watch(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<WatchEventStream<DynamicObject>, TransportError> {
        self.watch_opened_at.lock().unwrap().push(Instant::now());
        if self.not_found() {
            return Err(TransportError::NotFound(descriptor.display_name()));
        }
        if let Some(message) = self.watch_failure.lock().unwrap().clone() {
            return Err(TransportError::Stream(message));
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Stream("watch already consumed".to_string()))?;

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }
}

/// Sending side of a mock watch stream
#[derive(Debug)]
pub struct WatchFeed {
    sender: mpsc::UnboundedSender<FeedItem>,
}

impl WatchFeed {
    pub fn send(&self, event: WatchEvent<DynamicObject>) {
        self.sender.send(Ok(event)).unwrap();
    }

    /// Push a transport error into the stream
    pub fn fail(&self, error: TransportError) {
        self.sender.send(Err(error)).unwrap();
    }
}

/// Handler operation observed by a [`HandlerRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCall {
    Added(String),
    Updated(String),
    Deleted(String),
    Bookmarked(String),
    Error(String),
    CheckCurrentState,
}

impl HandlerCall {
    fn resource_name(&self) -> Option<&str> {
        match self {
            Self::Added(name)
            | Self::Updated(name)
            | Self::Deleted(name)
            | Self::Bookmarked(name)
            | Self::Error(name) => Some(name),
            Self::CheckCurrentState => None,
        }
    }
}

/// One started handler call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call: HandlerCall,
    /// Id of the handler instance that served the call
    pub instance: usize,
    pub started_at: Instant,
    pub resource: Option<DynamicObject>,
}

#[derive(Debug, Default)]
struct RecorderState {
    started: Mutex<Vec<CallRecord>>,
    completed: Mutex<Vec<HandlerCall>>,
    instances: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    reconcile_failure: Mutex<Option<String>>,
    reconcile_delay: Mutex<Option<Duration>>,
    reconcile_cancels: Mutex<bool>,
}

/// Records every call made to the handlers it creates
#[derive(Debug, Clone, Default)]
pub struct HandlerRecorder {
    state: Arc<RecorderState>,
}

impl HandlerRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler factory; every call yields a handler with a new instance id
    pub fn factory(&self) -> impl Fn() -> RecordingHandler + Send + Sync + 'static {
        let recorder = self.clone();
        move || recorder.create()
    }

    fn create(&self) -> RecordingHandler {
        let instance = self.state.instances.fetch_add(1, Ordering::SeqCst) + 1;
        RecordingHandler {
            instance,
            recorder: self.clone(),
        }
    }

    /// Delay every event handler call for the named resource
    pub fn delay(&self, name: &str, delay: Duration) {
        self.state.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Fail every event handler call for the named resource
    pub fn fail_on(&self, name: &str) {
        self.state.failing.lock().unwrap().insert(name.to_string());
    }

    /// Fail every `check_current_state` call
    pub fn fail_reconciliation(&self, message: &str) {
        *self.state.reconcile_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make `check_current_state` report cooperative cancellation
    pub fn cancel_reconciliation(&self) {
        *self.state.reconcile_cancels.lock().unwrap() = true;
    }

    /// Delay every `check_current_state` call
    pub fn delay_reconciliation(&self, delay: Duration) {
        *self.state.reconcile_delay.lock().unwrap() = Some(delay);
    }

    pub fn started(&self) -> Vec<CallRecord> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.started().into_iter().map(|record| record.call).collect()
    }

    /// Completed calls in completion order
    pub fn completed(&self) -> Vec<HandlerCall> {
        self.state.completed.lock().unwrap().clone()
    }

    pub fn reconciliations(&self) -> Vec<CallRecord> {
        self.started()
            .into_iter()
            .filter(|record| record.call == HandlerCall::CheckCurrentState)
            .collect()
    }

    pub fn instances_created(&self) -> usize {
        self.state.instances.load(Ordering::SeqCst)
    }

    /// Highest number of event handler calls observed running at once
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    async fn record(
        &self,
        instance: usize,
        call: HandlerCall,
        resource: Option<&DynamicObject>,
    ) -> anyhow::Result<()> {
        let name = call.resource_name().map(str::to_string);
        self.state.started.lock().unwrap().push(CallRecord {
            call: call.clone(),
            instance,
            started_at: Instant::now(),
            resource: resource.cloned(),
        });

        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = match &name {
            Some(name) => self.state.delays.lock().unwrap().get(name).copied(),
            None => *self.state.reconcile_delay.lock().unwrap(),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.completed.lock().unwrap().push(call);

        match &name {
            Some(name) if self.state.failing.lock().unwrap().contains(name) => {
                Err(anyhow::anyhow!("handler failed for {name}"))
            }
            Some(_) => Ok(()),
            None => {
                if *self.state.reconcile_cancels.lock().unwrap() {
                    return Err(Cancelled.into());
                }
                match self.state.reconcile_failure.lock().unwrap().clone() {
                    Some(message) => Err(anyhow::anyhow!(message)),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Handler instance created by a [`HandlerRecorder`] factory
#[derive(Debug)]
pub struct RecordingHandler {
    instance: usize,
    recorder: HandlerRecorder,
}

#[async_trait]
impl OperationHandler<DynamicObject> for RecordingHandler {
    async fn on_added(&self, resource: &DynamicObject, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::Added(resource.name_any()), Some(resource))
            .await
    }

    async fn on_updated(&self, resource: &DynamicObject, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::Updated(resource.name_any()), Some(resource))
            .await
    }

    async fn on_deleted(&self, resource: &DynamicObject, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::Deleted(resource.name_any()), Some(resource))
            .await
    }

    async fn on_bookmarked(&self, resource: &DynamicObject, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::Bookmarked(resource.name_any()), Some(resource))
            .await
    }

    async fn on_error(&self, resource: &DynamicObject, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::Error(resource.name_any()), Some(resource))
            .await
    }

    async fn check_current_state(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.recorder
            .record(self.instance, HandlerCall::CheckCurrentState, None)
            .await
    }
}
