use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use shared::{
    domain::{CollectionPath, DocumentId},
    error::{ApiError, ErrorCode},
    protocol::StoredDocument,
};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{DocumentStore, ListenerRegistration, SnapshotEvent, LISTENER_BUFFER};
use crate::{auth::AuthenticatedUser, error::StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerLogEntry {
    Attached(CollectionPath),
    Released(CollectionPath),
}

#[derive(Debug, Clone)]
enum Change {
    Documents(CollectionPath),
    ListenError(CollectionPath, ApiError),
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<CollectionPath, Vec<StoredDocument>>,
    next_id: u64,
    listener_log: Vec<ListenerLogEntry>,
    active_listeners: usize,
    pending_write_failure: Option<ApiError>,
}

/// In-process store with the same owner-only access rule as the service.
/// Records listener attach/release order for inspection.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `document` as-is, bypassing access checks.
    pub fn insert_raw(&self, path: &CollectionPath, document: StoredDocument) {
        self.lock()
            .collections
            .entry(path.clone())
            .or_default()
            .push(document);
        let _ = self.changes.send(Change::Documents(path.clone()));
    }

    pub fn documents(&self, path: &CollectionPath) -> Vec<StoredDocument> {
        self.lock()
            .collections
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes the next add or delete fail with `err`.
    pub fn fail_next_write(&self, err: ApiError) {
        self.lock().pending_write_failure = Some(err);
    }

    /// Pushes `err` to every listener attached to `path`.
    pub fn emit_listen_error(&self, path: &CollectionPath, err: ApiError) {
        let _ = self.changes.send(Change::ListenError(path.clone(), err));
    }

    pub fn active_listeners(&self) -> usize {
        self.lock().active_listeners
    }

    pub fn listener_log(&self) -> Vec<ListenerLogEntry> {
        self.lock().listener_log.clone()
    }

    fn check_owner(user: &AuthenticatedUser, path: &CollectionPath) -> Result<(), ApiError> {
        if path.owner() == &user.identity {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::PermissionDenied,
                format!("{} may not access {path}", user.identity),
            ))
        }
    }

    fn take_write_failure(&self) -> Result<(), StoreError> {
        match self.lock().pending_write_failure.take() {
            Some(err) => Err(StoreError::from(err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn add(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        data: Map<String, Value>,
    ) -> Result<DocumentId, StoreError> {
        Self::check_owner(user, path)?;
        self.take_write_failure()?;
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = DocumentId(format!("doc-{}", state.next_id));
            state
                .collections
                .entry(path.clone())
                .or_default()
                .push(StoredDocument {
                    id: id.clone(),
                    create_time: Utc::now(),
                    data,
                });
            id
        };
        debug!(%path, doc_id = %id, "memory store: document added");
        let _ = self.changes.send(Change::Documents(path.clone()));
        Ok(id)
    }

    async fn delete(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        id: &DocumentId,
    ) -> Result<(), StoreError> {
        Self::check_owner(user, path)?;
        self.take_write_failure()?;
        let removed = {
            let mut state = self.lock();
            let documents = state.collections.entry(path.clone()).or_default();
            let before = documents.len();
            documents.retain(|doc| &doc.id != id);
            documents.len() != before
        };
        if !removed {
            return Err(StoreError::NotFound(format!("document {id} not found")));
        }
        let _ = self.changes.send(Change::Documents(path.clone()));
        Ok(())
    }

    async fn listen(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
    ) -> Result<ListenerRegistration, StoreError> {
        let denied = Self::check_owner(user, path).err();
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        {
            let mut state = self.lock();
            state.active_listeners += 1;
            state
                .listener_log
                .push(ListenerLogEntry::Attached(path.clone()));
        }

        let store = self.clone();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let initial = match denied {
                Some(err) => SnapshotEvent::Error(err),
                None => SnapshotEvent::Snapshot(store.documents(&task_path)),
            };
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                let event = match changes.recv().await {
                    Ok(Change::Documents(changed)) if changed == task_path => {
                        SnapshotEvent::Snapshot(store.documents(&task_path))
                    }
                    Ok(Change::ListenError(changed, err)) if changed == task_path => {
                        SnapshotEvent::Error(err)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        SnapshotEvent::Snapshot(store.documents(&task_path))
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let release_state = Arc::clone(&self.state);
        let release_path = path.clone();
        Ok(
            ListenerRegistration::new(path.clone(), rx, task).with_release_hook(move || {
                let mut state = release_state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.active_listeners = state.active_listeners.saturating_sub(1);
                state
                    .listener_log
                    .push(ListenerLogEntry::Released(release_path));
            }),
        )
    }
}
