//! Kubernetes-backed [`ResourceClient`].
//!
//! Talks to the API server through a [`kube::Client`] using a dynamic API
//! built from the descriptor's group, version and plural, and decodes every
//! object into the typed snapshot `K`.

use crate::client::{ResourceClient, WatchEventStream};
use crate::descriptor::ResourceDescriptor;
use crate::error::{ControllerError, TransportError};
use crate::event::WatchEvent;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchEvent as KubeWatchEvent,
    WatchParams,
};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use tracing::{debug, warn};

/// Resource client backed by the Kubernetes API server.
///
/// Watches survive the server's watch timeout: when a watch request ends
/// normally it is reissued from the last seen resource version. Only real
/// failures end the stream with an error.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Creates a client from an existing connection.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using in-cluster config or the local kubeconfig, whichever applies.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Transport`] when no configuration can be inferred.
    pub async fn try_default() -> Result<Self, ControllerError> {
        let client = Client::try_default().await.map_err(TransportError::from)?;
        Ok(Self::new(client))
    }

    fn api<K>(&self, descriptor: &ResourceDescriptor) -> (Api<DynamicObject>, ApiResource)
    where
        K: Resource<DynamicType = ()>,
    {
        let gvk = GroupVersionKind::gvk(descriptor.group(), descriptor.version(), &K::kind(&()));
        let ar = ApiResource::from_gvk_with_plural(&gvk, descriptor.plural());
        let api = Api::namespaced_with(self.client.clone(), descriptor.namespace(), &ar);
        (api, ar)
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<Vec<K>, TransportError> {
        let (api, _) = self.api::<K>(descriptor);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, descriptor))?;

        list.items.iter().map(decode).collect()
    }

    async fn watch(&self, descriptor: &ResourceDescriptor) -> Result<WatchEventStream<K>, TransportError> {
        let (api, ar) = self.api::<K>(descriptor);
        debug!("Opening watch for {} in namespace {}", descriptor.display_name(), descriptor.namespace());

        let mut session = WatchSession {
            api,
            ar,
            descriptor: descriptor.clone(),
            // "0" starts from any cached version: existing objects arrive as ADDED first
            resource_version: "0".to_string(),
            events: None,
        };
        let events = session.open().await?;
        session.events = Some(events);

        Ok(stream::unfold(session, |mut session| async move {
            let item: Result<WatchEvent<K>, TransportError> = session
                .next_event()
                .await
                .and_then(|event| convert(event, &session.ar));
            Some((item, session))
        })
        .boxed())
    }
}

impl fmt::Debug for KubeResourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeResourceClient")
            .field("default_namespace", &self.client.default_namespace())
            .finish_non_exhaustive()
    }
}

type RawEvents = BoxStream<'static, Result<KubeWatchEvent<DynamicObject>, kube::Error>>;

/// One logical watch spanning any number of server-side watch requests.
///
/// The API server ends every watch request after its timeout. The session
/// then reissues the request from the last resource version it delivered,
/// so the stream it backs only ends when the caller drops it.
struct WatchSession {
    api: Api<DynamicObject>,
    ar: ApiResource,
    descriptor: ResourceDescriptor,
    resource_version: String,
    events: Option<RawEvents>,
}

impl WatchSession {
    async fn open(&mut self) -> Result<RawEvents, TransportError> {
        let events = self
            .api
            .watch(&WatchParams::default(), &self.resource_version)
            .await
            .map_err(|e| classify(e, &self.descriptor))?;
        Ok(events.boxed())
    }

    async fn next_event(&mut self) -> Result<KubeWatchEvent<DynamicObject>, TransportError> {
        loop {
            let events = match self.events.take() {
                Some(events) => events,
                None => self.open().await?,
            };
            let next = self.events.insert(events).next().await;

            match next {
                Some(Ok(event)) => {
                    self.observe(&event);
                    return Ok(event);
                }
                Some(Err(kube::Error::SerdeError(e))) => return Err(TransportError::Decode(e)),
                Some(Err(e)) => return Err(TransportError::Kube(e)),
                None => {
                    debug!(
                        "Watch for {} ended by the server, resuming from resource version {}",
                        self.descriptor.display_name(),
                        self.resource_version
                    );
                    self.events = None;
                }
            }
        }
    }

    fn observe(&mut self, event: &KubeWatchEvent<DynamicObject>) {
        let seen = match event {
            KubeWatchEvent::Added(object)
            | KubeWatchEvent::Modified(object)
            | KubeWatchEvent::Deleted(object) => object.metadata.resource_version.clone(),
            KubeWatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.clone()),
            // 410 Gone: the version was compacted away, start over from any cached version
            KubeWatchEvent::Error(response) if response.code == 410 => Some("0".to_string()),
            KubeWatchEvent::Error(_) => None,
        };
        if let Some(resource_version) = seen {
            self.resource_version = resource_version;
        }
    }
}

fn classify(err: kube::Error, descriptor: &ResourceDescriptor) -> TransportError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => {
            TransportError::NotFound(descriptor.display_name())
        }
        other => TransportError::Kube(other),
    }
}

fn decode<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, TransportError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Builds the snapshot for frames that carry no full object.
///
/// Snapshot types whose spec has required fields cannot represent these and
/// surface a decode error instead.
fn metadata_only<K: DeserializeOwned>(
    ar: &ApiResource,
    resource_version: Option<&str>,
) -> Result<K, TransportError> {
    let document = json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": { "resourceVersion": resource_version },
        "spec": {},
    });
    Ok(serde_json::from_value(document)?)
}

fn convert<K: DeserializeOwned>(
    event: KubeWatchEvent<DynamicObject>,
    ar: &ApiResource,
) -> Result<WatchEvent<K>, TransportError> {
    match event {
        KubeWatchEvent::Added(object) => Ok(WatchEvent::added(decode(&object)?)),
        KubeWatchEvent::Modified(object) => Ok(WatchEvent::modified(decode(&object)?)),
        KubeWatchEvent::Deleted(object) => Ok(WatchEvent::deleted(decode(&object)?)),
        KubeWatchEvent::Bookmark(bookmark) => Ok(WatchEvent::bookmark(metadata_only(
            ar,
            Some(&bookmark.metadata.resource_version),
        )?)),
        KubeWatchEvent::Error(response) => {
            warn!(
                "Watch for {} reported error {} ({}): {}",
                ar.plural, response.code, response.reason, response.message
            );
            Ok(WatchEvent::error(metadata_only(ar, None)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WatchEventKind;
    use crate::mock::widgets;
    use crds::Widget;
    use kube::ResourceExt;
    use kube::client::Body;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Deserialize)]
    struct Loose {
        metadata: kube::api::ObjectMeta,
        #[serde(default)]
        spec: serde_json::Value,
    }

    #[derive(Debug, Deserialize)]
    struct Strict {
        #[allow(dead_code, reason = "decoded only to check failure")]
        spec: StrictSpec,
    }

    #[derive(Debug, Deserialize)]
    struct StrictSpec {
        #[allow(dead_code, reason = "decoded only to check failure")]
        size: u32,
    }

    fn widget_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("example.io", "v1alpha1", "Widget"),
            "widgets",
        )
    }

    #[test]
    fn test_convert_added_keeps_object() {
        let ar = widget_resource();
        let mut object = DynamicObject::new("w1", &ar).within("default");
        object.data = json!({ "spec": { "size": 3 } });

        let event: WatchEvent<Loose> = convert(KubeWatchEvent::Added(object), &ar).unwrap();
        assert_eq!(event.kind, WatchEventKind::Added);
        assert_eq!(event.resource.metadata.name.as_deref(), Some("w1"));
        assert_eq!(event.resource.spec["size"], 3);
    }

    #[test]
    fn test_convert_deleted_and_modified_kinds() {
        let ar = widget_resource();
        let object = DynamicObject::new("w1", &ar).within("default");

        let modified: WatchEvent<DynamicObject> =
            convert(KubeWatchEvent::Modified(object.clone()), &ar).unwrap();
        let deleted: WatchEvent<DynamicObject> = convert(KubeWatchEvent::Deleted(object), &ar).unwrap();
        assert_eq!(modified.kind, WatchEventKind::Modified);
        assert_eq!(deleted.kind, WatchEventKind::Deleted);
        assert_eq!(deleted.resource.name_any(), "w1");
    }

    #[test]
    fn test_metadata_only_snapshot_carries_resource_version() {
        let ar = widget_resource();
        let snapshot: Loose = metadata_only(&ar, Some("4711")).unwrap();
        assert_eq!(snapshot.metadata.resource_version.as_deref(), Some("4711"));
    }

    #[test]
    fn test_strict_snapshot_cannot_represent_bookmark() {
        let ar = widget_resource();
        let result: Result<Strict, _> = metadata_only(&ar, Some("1"));
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }

    /// A client whose API server answers each request with the next body,
    /// ending the response after it, and fails once the bodies run out.
    fn scripted_client(bodies: &[&str]) -> (KubeResourceClient, Arc<Mutex<Vec<String>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let bodies = Arc::new(Mutex::new(
            bodies.iter().map(|body| body.to_string()).collect::<VecDeque<_>>(),
        ));
        let seen = Arc::clone(&requests);
        let service = tower::service_fn(move |request: http::Request<Body>| {
            seen.lock().unwrap().push(request.uri().to_string());
            let body = bodies.lock().unwrap().pop_front();
            async move {
                match body {
                    Some(body) => Ok(http::Response::new(Body::from(body.into_bytes()))),
                    None => Err(std::io::Error::other("connection refused")),
                }
            }
        });
        (KubeResourceClient::new(Client::new(service, "default")), requests)
    }

    fn frame(kind: &str, name: &str, resource_version: &str) -> String {
        let object = json!({
            "type": kind,
            "object": {
                "apiVersion": "example.io/v1alpha1",
                "kind": "Widget",
                "metadata": { "name": name, "namespace": "default", "resourceVersion": resource_version },
                "spec": {},
            },
        });
        format!("{object}\n")
    }

    fn bookmark_frame(resource_version: &str) -> String {
        let object = json!({
            "type": "BOOKMARK",
            "object": {
                "apiVersion": "example.io/v1alpha1",
                "kind": "Widget",
                "metadata": { "resourceVersion": resource_version },
            },
        });
        format!("{object}\n")
    }

    #[tokio::test]
    async fn test_watch_resumes_after_server_ends_response() {
        let first = frame("ADDED", "w1", "10");
        let second = format!("{}{}", frame("MODIFIED", "w1", "11"), bookmark_frame("12"));
        let third = frame("DELETED", "w1", "13");
        let (client, requests) = scripted_client(&[&first, &second, &third]);

        let stream = ResourceClient::<Widget>::watch(&client, &widgets()).await.unwrap();
        let items: Vec<_> = stream.take(5).collect().await;

        let kinds: Vec<_> = items[..4]
            .iter()
            .map(|item| item.as_ref().unwrap().kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                WatchEventKind::Added,
                WatchEventKind::Modified,
                WatchEventKind::Bookmark,
                WatchEventKind::Deleted,
            ]
        );
        assert_eq!(items[3].as_ref().unwrap().resource.name_any(), "w1");
        // A failed reopen is a real transport failure
        assert!(matches!(items[4], Err(TransportError::Kube(_))));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert!(requests[0].contains("/apis/example.io/v1alpha1/namespaces/default/widgets"));
        assert!(requests[0].contains("resourceVersion=0"));
        assert!(requests[1].contains("resourceVersion=10"));
        assert!(requests[2].contains("resourceVersion=12"));
        assert!(requests[3].contains("resourceVersion=13"));
    }

    #[tokio::test]
    async fn test_watch_restarts_from_scratch_after_gone() {
        let gone = json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "too old resource version: 10 (20)",
                "reason": "Expired",
                "code": 410,
            },
        });
        let first = format!("{}{gone}\n", frame("ADDED", "w1", "10"));
        let second = frame("ADDED", "w1", "21");
        let (client, requests) = scripted_client(&[&first, &second]);

        let stream = ResourceClient::<Widget>::watch(&client, &widgets()).await.unwrap();
        let items: Vec<_> = stream.take(3).collect().await;

        let kinds: Vec<_> = items.iter().map(|item| item.as_ref().unwrap().kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![WatchEventKind::Added, WatchEventKind::Error, WatchEventKind::Added]
        );
        let requests = requests.lock().unwrap();
        assert!(requests[1].contains("resourceVersion=0"));
    }

    #[tokio::test]
    async fn test_watch_open_failure_is_returned() {
        let (client, _) = scripted_client(&[]);

        let result = ResourceClient::<Widget>::watch(&client, &widgets()).await;

        assert!(matches!(result, Err(TransportError::Kube(_))));
    }
}
