use std::{future::Future, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{CollectionPath, DocumentId},
    protocol::DesignRecord,
};
use tracing::{info, warn};

use crate::{
    auth::{AuthSession, AuthenticatedUser},
    error::{AuthError, StoreError, StudioError},
    store::DocumentStore,
    studio::{CurrentDesign, StudioSession},
};

/// Approve and delete writes against the signed-in user's design collection.
///
/// Neither call touches the approved list; it only changes once the sync
/// adapter observes the write.
pub struct DesignController {
    store: Option<Arc<dyn DocumentStore>>,
    auth: Arc<AuthSession>,
}

impl DesignController {
    pub fn new(store: Option<Arc<dyn DocumentStore>>, auth: Arc<AuthSession>) -> Self {
        Self { store, auth }
    }

    /// Persists the design on screen. Success clears it; failure keeps it and
    /// records the error on the session.
    pub async fn approve(&self, session: &mut StudioSession) -> Result<DocumentId, StudioError> {
        let Some(design) = session.current_design().cloned() else {
            let err = StudioError::Validation("there is no generated design to approve".into());
            session.set_error(err.to_string());
            return Err(err);
        };

        match self.write_design(design).await {
            Ok(id) => {
                info!(doc_id = %id, "persistence: design approved");
                session.clear_current_design();
                session.clear_error();
                Ok(id)
            }
            Err(err) => {
                warn!(error = %err, "persistence: approve failed");
                session.set_error(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn delete(
        &self,
        session: &mut StudioSession,
        id: &DocumentId,
    ) -> Result<(), StudioError> {
        match self.remove_design(id).await {
            Ok(()) => {
                info!(doc_id = %id, "persistence: design deleted");
                Ok(())
            }
            Err(err) => {
                warn!(doc_id = %id, error = %err, "persistence: delete failed");
                session.set_error(err.to_string());
                Err(err)
            }
        }
    }

    async fn write_design(&self, design: CurrentDesign) -> Result<DocumentId, StudioError> {
        let store = self.ready_store()?;
        let record = DesignRecord {
            prompt: design.prompt,
            style: design.style,
            mode: Some(design.mode),
            image_url: design.image.data_uri,
            created_at: Some(Utc::now()),
        };
        let data = record
            .into_document_data()
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        self.with_fresh_token(|user, path| {
            let data = data.clone();
            async move { store.add(&user, &path, data).await }
        })
        .await
    }

    async fn remove_design(&self, id: &DocumentId) -> Result<(), StudioError> {
        let store = self.ready_store()?;
        self.with_fresh_token(|user, path| async move { store.delete(&user, &path, id).await })
            .await
    }

    /// Runs `write` as the current user. An expired ID token is refreshed once
    /// and the write repeated.
    async fn with_fresh_token<T, F, Fut>(&self, write: F) -> Result<T, StudioError>
    where
        F: Fn(AuthenticatedUser, CollectionPath) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (user, path) = self.scope()?;
        match write(user, path.clone()).await {
            Err(StoreError::Unauthorized(message)) => {
                warn!(error = %message, "persistence: id token rejected, refreshing");
                let user = self.auth.refresh().await?;
                Ok(write(user, path).await?)
            }
            result => Ok(result?),
        }
    }

    fn ready_store(&self) -> Result<&Arc<dyn DocumentStore>, StoreError> {
        self.store.as_ref().ok_or(StoreError::NotReady)
    }

    fn scope(&self) -> Result<(AuthenticatedUser, CollectionPath), StudioError> {
        let user = self.auth.current_user().ok_or(AuthError::NotSignedIn)?;
        let path = CollectionPath::approved_designs(&user.identity)
            .map_err(|err| StudioError::Validation(err.to_string()))?;
        Ok((user, path))
    }
}
