//! Transport seam.
//!
//! [`ResourceClient`] is everything the engine needs from the API server:
//! a list call (used only to learn whether the resource type is served) and
//! a streaming watch. The engine treats implementations as stateless and
//! safe for concurrent use by all of its subsystems.

use crate::descriptor::ResourceDescriptor;
use crate::error::TransportError;
use crate::event::WatchEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A lazy, potentially infinite sequence of watch events.
///
/// It cannot be restarted: once it fails or ends, a new one has to be opened.
pub type WatchEventStream<K> = BoxStream<'static, Result<WatchEvent<K>, TransportError>>;

/// Trait for the API server operations used by the engine.
///
/// Implementations must report an unregistered resource type as
/// [`TransportError::NotFound`], distinct from every other failure.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Lists resources of the descriptor's type in its namespace.
    async fn list(&self, descriptor: &ResourceDescriptor) -> Result<Vec<K>, TransportError>;

    /// Opens one streaming watch for the descriptor's type and namespace.
    ///
    /// The stream must outlive any server-side watch timeout; ending it is
    /// reported to the engine as [`TransportError::Closed`].
    async fn watch(&self, descriptor: &ResourceDescriptor) -> Result<WatchEventStream<K>, TransportError>;
}
