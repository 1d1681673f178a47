//! Coordination sessions and change notifications

use async_trait::async_trait;
use beacon_config::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::settings::ConnectionSettings;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection lost: {0}")]
    ConnectionLoss(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session closed")]
    SessionClosed,

    #[error("Record already exists: {0}")]
    NodeExists(String),

    #[error("No record at {0}")]
    NoNode(String),

    #[error("Coordination service error: {0}")]
    Backend(String),
}

impl DiscoveryError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiscoveryError::ConnectionLoss(_) | DiscoveryError::Timeout(_)
        )
    }
}

/// A record under a watched root, with its payload if one was readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    /// Full path of the record
    pub path: String,

    /// Payload bytes
    pub data: Option<Vec<u8>>,
}

impl ChildRecord {
    pub fn new(path: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        node_name(&self.path)
    }
}

/// Kind of change observed on a child record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Updated,
    Removed,
}

/// A change to one child of a watched root.
///
/// For `Removed`, `record.data` is the last payload known to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub record: ChildRecord,
}

impl ChildEvent {
    pub fn added(path: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: ChildEventKind::Added,
            record: ChildRecord::new(path, data),
        }
    }

    pub fn updated(path: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: ChildEventKind::Updated,
            record: ChildRecord::new(path, data),
        }
    }

    pub fn removed(path: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: ChildEventKind::Removed,
            record: ChildRecord::new(path, data),
        }
    }
}

/// Receiving end of a persistent child watch. Closed when the watch ends.
pub type ChildWatch = mpsc::UnboundedReceiver<ChildEvent>;

/// One live session with the coordination service.
///
/// Ephemeral records created through a session live exactly as long as the
/// session: they are removed on [`close`](Self::close) and, if the owner
/// disappears without closing, when the service expires the session.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Identifier of the session, for diagnostics
    fn id(&self) -> String;

    /// Whether a record exists at `path`
    async fn exists(&self, path: &str) -> Result<bool, DiscoveryError>;

    /// Create an ephemeral record; fails with `NodeExists` if one is present
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError>;

    /// Create a record that outlives the session; fails with `NodeExists`
    /// if one is present
    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError>;

    /// Replace the payload of an existing record; fails with `NoNode` if absent
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError>;

    /// Delete a record; fails with `NoNode` if absent
    async fn delete(&self, path: &str) -> Result<(), DiscoveryError>;

    /// Direct children of `root` with their payloads
    async fn list_children(&self, root: &str) -> Result<Vec<ChildRecord>, DiscoveryError>;

    /// Subscribe to changes of the direct children of `root`.
    ///
    /// The watch first replays an `Added` event for every child that exists
    /// at subscription time, then delivers changes as they happen. Events
    /// for one path arrive in order; events for different paths may
    /// interleave arbitrarily.
    async fn watch_children(&self, root: &str) -> Result<ChildWatch, DiscoveryError>;

    /// End the session, removing its ephemeral records and cancelling its
    /// watches. Idempotent.
    async fn close(&self);
}

/// Opens independent sessions against a coordination service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt.
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn CoordinationSession>, DiscoveryError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn CoordinationSession>, DiscoveryError> {
        (**self).connect(settings).await
    }
}

/// Path of the child `name` under `root`
pub fn child_path(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name)
}

/// Last segment of a record path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` is a direct child of `root`
pub fn is_direct_child(root: &str, path: &str) -> bool {
    path.strip_prefix(root.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.is_empty() && !name.contains('/'))
}
