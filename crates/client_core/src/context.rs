use std::sync::Arc;

use shared::domain::DocumentId;
use tokio::sync::watch;
use tracing::info;

use crate::{
    auth::{AuthSession, AuthenticatedUser, HttpIdentityProvider, IdentityProvider, SignInMethod},
    config::ClientConfig,
    error::StudioError,
    generation::ImageClient,
    persistence::DesignController,
    store::{DocumentStore, HttpDocumentStore},
    studio::{GenerationOutcome, StudioSession},
    sync::{DesignListState, SyncAdapter, SyncHandle},
};

/// Everything a front end needs, created once at startup and torn down with
/// [`StudioContext::shutdown`].
pub struct StudioContext {
    images: ImageClient,
    auth: Arc<AuthSession>,
    sign_in_method: SignInMethod,
    designs: DesignController,
    sync: Option<SyncHandle>,
}

impl StudioContext {
    pub fn init(config: &ClientConfig) -> Result<Self, StudioError> {
        let images = ImageClient::new(
            config.api_key.clone(),
            config.generation.clone(),
            config.retry.policy(),
        )?;
        let provider: Arc<dyn IdentityProvider> =
            Arc::new(HttpIdentityProvider::new(config.store.server_url.clone()));
        let store: Arc<dyn DocumentStore> =
            Arc::new(HttpDocumentStore::new(&config.store.server_url)?);
        let sign_in_method = SignInMethod::from_custom_token(config.store.custom_token.as_deref());
        info!(store = %config.store.server_url, "studio: context initialised");
        Ok(Self::from_parts(images, provider, store, sign_in_method))
    }

    pub fn from_parts(
        images: ImageClient,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        sign_in_method: SignInMethod,
    ) -> Self {
        let auth = Arc::new(AuthSession::new(provider));
        let sync = SyncAdapter::spawn(Arc::clone(&store), auth.subscribe());
        let designs = DesignController::new(Some(store), Arc::clone(&auth));
        Self {
            images,
            auth,
            sign_in_method,
            designs,
            sync: Some(sync),
        }
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub async fn sign_in(&self) -> Result<AuthenticatedUser, StudioError> {
        Ok(self.auth.sign_in(&self.sign_in_method).await?)
    }

    pub fn designs(&self) -> watch::Receiver<DesignListState> {
        match &self.sync {
            Some(sync) => sync.subscribe(),
            None => watch::channel(DesignListState::default()).1,
        }
    }

    /// Runs one generation for the session's current form state.
    pub async fn generate(&self, session: &mut StudioSession) -> Result<GenerationOutcome, StudioError> {
        let pending = session.begin_generation()?;
        let result = self
            .images
            .generate(&pending.prompt, pending.request.reference_image.as_ref())
            .await;
        Ok(session.complete_generation(pending, result)?)
    }

    pub async fn approve(&self, session: &mut StudioSession) -> Result<DocumentId, StudioError> {
        self.designs.approve(session).await
    }

    pub async fn delete(
        &self,
        session: &mut StudioSession,
        id: &DocumentId,
    ) -> Result<(), StudioError> {
        self.designs.delete(session, id).await
    }

    /// Signs out and stops the sync adapter, releasing its listener.
    pub async fn shutdown(mut self) {
        self.auth.sign_out();
        if let Some(sync) = self.sync.take() {
            sync.shutdown().await;
        }
        info!("studio: context shut down");
    }
}
