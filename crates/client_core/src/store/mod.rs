use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{
    domain::{CollectionPath, DocumentId},
    error::ApiError,
    protocol::StoredDocument,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{auth::AuthenticatedUser, error::StoreError};

mod http;
mod memory;

pub use http::HttpDocumentStore;
pub use memory::{ListenerLogEntry, MemoryDocumentStore};

pub(crate) const LISTENER_BUFFER: usize = 32;

/// One delivery from a store listener.
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    /// Full contents of the watched collection.
    Snapshot(Vec<StoredDocument>),
    Error(ApiError),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn add(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        data: Map<String, Value>,
    ) -> Result<DocumentId, StoreError>;

    async fn delete(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        id: &DocumentId,
    ) -> Result<(), StoreError>;

    /// Attaches a listener that receives a full snapshot on attach and after
    /// every change to `path`.
    async fn listen(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
    ) -> Result<ListenerRegistration, StoreError>;
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// An attached listener. Releasing it, explicitly or by dropping it, stops
/// delivery and tears down the underlying subscription.
pub struct ListenerRegistration {
    path: CollectionPath,
    events: mpsc::Receiver<SnapshotEvent>,
    task: Option<JoinHandle<()>>,
    on_release: Option<ReleaseHook>,
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ListenerRegistration {
    pub fn new(
        path: CollectionPath,
        events: mpsc::Receiver<SnapshotEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            path,
            events,
            task: Some(task),
            on_release: None,
        }
    }

    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    /// `None` once the subscription has ended.
    pub async fn next_event(&mut self) -> Option<SnapshotEvent> {
        self.events.recv().await
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        self.events.close();
        if let Some(hook) = self.on_release.take() {
            hook();
        }
        debug!(path = %self.path, "store: listener released");
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.release_inner();
    }
}
