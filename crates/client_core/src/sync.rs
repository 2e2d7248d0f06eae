use std::sync::Arc;

use shared::{
    domain::{CollectionPath, Identity},
    protocol::{DesignRecord, StoredDocument},
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthState, AuthenticatedUser},
    store::{DocumentStore, ListenerRegistration, SnapshotEvent},
    types::ApprovedDesign,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Uninitialized,
    AuthPending,
    Unauthenticated,
    Authenticated,
}

/// What the UI shows for the approved-designs list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesignListState {
    pub phase: SyncPhase,
    pub identity: Option<Identity>,
    /// Newest first.
    pub designs: Vec<ApprovedDesign>,
    pub error: Option<String>,
    pub snapshots_applied: u64,
}

/// Rebuilds the full list from one snapshot. Undecodable records are skipped.
pub fn designs_from_snapshot(documents: &[StoredDocument]) -> Vec<ApprovedDesign> {
    let mut designs: Vec<ApprovedDesign> = documents
        .iter()
        .filter_map(|doc| {
            match serde_json::from_value::<DesignRecord>(serde_json::Value::Object(doc.data.clone()))
            {
                Ok(record) => Some(ApprovedDesign {
                    id: doc.id.clone(),
                    prompt: record.prompt,
                    style: record.style,
                    mode: record.mode.unwrap_or_default(),
                    image_url: record.image_url,
                    created_at: record.created_at.unwrap_or(doc.create_time),
                }),
                Err(err) => {
                    warn!(doc_id = %doc.id, error = %err, "sync: skipping undecodable design");
                    None
                }
            }
        })
        .collect();
    designs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    designs
}

pub struct SyncAdapter;

impl SyncAdapter {
    /// Starts following `auth`. At most one store listener is attached at a
    /// time, always scoped to the current identity.
    pub fn spawn(store: Arc<dyn DocumentStore>, auth: watch::Receiver<AuthState>) -> SyncHandle {
        let (state_tx, state_rx) = watch::channel(DesignListState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_adapter(store, auth, state_tx, shutdown_rx));
        SyncHandle {
            state: state_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

pub struct SyncHandle {
    state: watch::Receiver<DesignListState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> watch::Receiver<DesignListState> {
        self.state.clone()
    }

    pub fn current(&self) -> DesignListState {
        self.state.borrow().clone()
    }

    /// Stops the adapter and waits until its listener has been released.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct ActiveListener {
    identity: Identity,
    registration: ListenerRegistration,
}

enum Step {
    Shutdown,
    AuthChanged,
    Listener(Option<SnapshotEvent>),
    Attached(Result<ActiveListener, String>),
}

async fn run_adapter(
    store: Arc<dyn DocumentStore>,
    mut auth: watch::Receiver<AuthState>,
    state: watch::Sender<DesignListState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut active: Option<ActiveListener> = None;
    let initial = auth.borrow_and_update().clone();
    let mut pending = apply_auth_state(&state, &mut active, initial);

    loop {
        // An attach in flight is raced against shutdown and auth changes and
        // abandoned if either wins.
        let step = match pending.take() {
            Some(user) => tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                changed = auth.changed() => match changed {
                    Ok(()) => Step::AuthChanged,
                    Err(_) => Step::Shutdown,
                },
                attached = attach_listener(store.as_ref(), &user) => Step::Attached(attached),
            },
            None => tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                changed = auth.changed() => match changed {
                    Ok(()) => Step::AuthChanged,
                    Err(_) => Step::Shutdown,
                },
                event = next_listener_event(&mut active) => Step::Listener(event),
            },
        };

        match step {
            Step::Shutdown => break,
            Step::AuthChanged => {
                let next = auth.borrow_and_update().clone();
                pending = apply_auth_state(&state, &mut active, next);
            }
            Step::Attached(Ok(listener)) => {
                info!(
                    identity = %listener.identity,
                    path = %listener.registration.path(),
                    "sync: listener attached"
                );
                active = Some(listener);
            }
            Step::Attached(Err(message)) => {
                state.send_modify(|current| current.error = Some(message));
            }
            Step::Listener(Some(SnapshotEvent::Snapshot(documents))) => {
                let designs = designs_from_snapshot(&documents);
                debug!(count = designs.len(), "sync: snapshot applied");
                state.send_modify(|current| {
                    current.designs = designs;
                    current.error = None;
                    current.snapshots_applied += 1;
                });
            }
            Step::Listener(Some(SnapshotEvent::Error(err))) => {
                warn!(code = ?err.code, message = %err.message, "sync: listener error");
                state.send_modify(|current| current.error = Some(err.message));
            }
            Step::Listener(None) => {
                warn!("sync: listener stream ended");
                release_listener(&mut active);
                state.send_modify(|current| {
                    current.error = Some("lost connection to the design store".to_string());
                });
            }
        }
    }

    release_listener(&mut active);
    debug!("sync: adapter stopped");
}

async fn next_listener_event(active: &mut Option<ActiveListener>) -> Option<SnapshotEvent> {
    match active {
        Some(listener) => listener.registration.next_event().await,
        None => std::future::pending().await,
    }
}

fn release_listener(active: &mut Option<ActiveListener>) {
    if let Some(listener) = active.take() {
        info!(identity = %listener.identity, "sync: releasing listener");
        listener.registration.release();
    }
}

/// Publishes the phase for `auth` and returns the user a listener still has
/// to be attached for, if any.
fn apply_auth_state(
    state: &watch::Sender<DesignListState>,
    active: &mut Option<ActiveListener>,
    auth: AuthState,
) -> Option<AuthenticatedUser> {
    let user = match auth {
        AuthState::Authenticated(user) => user,
        other => {
            release_listener(active);
            let phase = match other {
                AuthState::AuthPending => SyncPhase::AuthPending,
                AuthState::Unauthenticated => SyncPhase::Unauthenticated,
                _ => SyncPhase::Uninitialized,
            };
            state.send_replace(DesignListState {
                phase,
                ..DesignListState::default()
            });
            return None;
        }
    };

    if active
        .as_ref()
        .is_some_and(|listener| listener.identity == user.identity)
    {
        state.send_modify(|current| {
            current.phase = SyncPhase::Authenticated;
            current.identity = Some(user.identity.clone());
        });
        return None;
    }

    release_listener(active);
    state.send_replace(DesignListState {
        phase: SyncPhase::Authenticated,
        identity: Some(user.identity.clone()),
        ..DesignListState::default()
    });
    Some(user)
}

async fn attach_listener(
    store: &dyn DocumentStore,
    user: &AuthenticatedUser,
) -> Result<ActiveListener, String> {
    let path = CollectionPath::approved_designs(&user.identity).map_err(|err| err.to_string())?;
    match store.listen(user, &path).await {
        Ok(registration) => Ok(ActiveListener {
            identity: user.identity.clone(),
            registration,
        }),
        Err(err) => {
            warn!(identity = %user.identity, error = %err, "sync: failed to attach listener");
            Err(err.to_string())
        }
    }
}
