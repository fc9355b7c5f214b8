//! Watch events.

use std::fmt;

/// Kind of change reported by a watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// A resource was created, or existed when the watch started
    Added,
    /// A resource changed
    Modified,
    /// A resource was removed
    Deleted,
    /// Progress marker; the snapshot carries only a resource version
    Bookmark,
    /// The server reported an error inside the stream
    Error,
    /// Any type string the engine has no handler operation for
    Unknown(String),
}

impl WatchEventKind {
    /// Parses the `type` field of a watch frame (`ADDED`, `MODIFIED`, ...).
    pub fn from_wire(value: &str) -> Self {
        match value {
            "ADDED" => Self::Added,
            "MODIFIED" => Self::Modified,
            "DELETED" => Self::Deleted,
            "BOOKMARK" => Self::Bookmark,
            "ERROR" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Name used in log lines.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Added => "Added",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
            Self::Bookmark => "Bookmark",
            Self::Error => "Error",
            Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change notification and the resource snapshot it carries.
///
/// Produced by a [`crate::ResourceClient`] watch stream and consumed exactly
/// once by the [`crate::EventDispatcher`].
#[derive(Debug, Clone)]
pub struct WatchEvent<K> {
    /// What happened
    pub kind: WatchEventKind,
    /// Snapshot of the resource after the change
    pub resource: K,
}

impl<K> WatchEvent<K> {
    /// Pairs a kind with its snapshot.
    pub fn new(kind: WatchEventKind, resource: K) -> Self {
        Self { kind, resource }
    }

    /// Shorthand for an `Added` event.
    pub fn added(resource: K) -> Self {
        Self::new(WatchEventKind::Added, resource)
    }

    pub fn modified(resource: K) -> Self {
        Self::new(WatchEventKind::Modified, resource)
    }

    pub fn deleted(resource: K) -> Self {
        Self::new(WatchEventKind::Deleted, resource)
    }

    pub fn bookmark(resource: K) -> Self {
        Self::new(WatchEventKind::Bookmark, resource)
    }

    pub fn error(resource: K) -> Self {
        Self::new(WatchEventKind::Error, resource)
    }
}
