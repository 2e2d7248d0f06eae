use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::Identity,
    error::ApiError,
    protocol::{CustomTokenSignInRequest, RefreshSessionRequest, SignInResponse},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub identity: Identity,
    pub id_token: String,
    pub is_anonymous: bool,
}

/// Identity lifecycle observed by the sync adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Uninitialized,
    AuthPending,
    Unauthenticated,
    Authenticated(AuthenticatedUser),
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        match self {
            AuthState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.user().map(|user| &user.identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInMethod {
    Anonymous,
    CustomToken(String),
}

impl SignInMethod {
    /// Custom token when one is configured, anonymous otherwise.
    pub fn from_custom_token(token: Option<&str>) -> Self {
        match token.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => SignInMethod::CustomToken(token.to_string()),
            None => SignInMethod::Anonymous,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, method: &SignInMethod) -> Result<AuthenticatedUser, AuthError>;

    /// Trades `user`'s ID token for a fresh one. The identity must not change.
    async fn refresh(&self, user: &AuthenticatedUser) -> Result<AuthenticatedUser, AuthError>;
}

pub struct HttpIdentityProvider {
    http: Client,
    server_url: String,
}

impl HttpIdentityProvider {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_in(&self, method: &SignInMethod) -> Result<AuthenticatedUser, AuthError> {
        let request = match method {
            SignInMethod::Anonymous => self
                .http
                .post(format!("{}/auth/anonymous", self.server_url)),
            SignInMethod::CustomToken(token) => self
                .http
                .post(format!("{}/auth/custom_token", self.server_url))
                .json(&CustomTokenSignInRequest {
                    token: token.clone(),
                }),
        };
        read_session(request.send().await?).await
    }

    async fn refresh(&self, user: &AuthenticatedUser) -> Result<AuthenticatedUser, AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/refresh", self.server_url))
            .json(&RefreshSessionRequest {
                id_token: user.id_token.clone(),
            })
            .send()
            .await?;
        read_session(response).await
    }
}

async fn read_session(response: Response) -> Result<AuthenticatedUser, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|err| err.message)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        return Err(AuthError::Rejected(message));
    }
    let session: SignInResponse = response.json().await?;
    Ok(AuthenticatedUser {
        identity: session.identity,
        id_token: session.id_token,
        is_anonymous: session.is_anonymous,
    })
}

/// Current identity plus a change feed for it.
pub struct AuthSession {
    provider: Arc<dyn IdentityProvider>,
    state: watch::Sender<AuthState>,
}

impl AuthSession {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        let (state, _) = watch::channel(AuthState::Uninitialized);
        Self { provider, state }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<AuthenticatedUser> {
        self.state.borrow().user().cloned()
    }

    pub async fn sign_in(&self, method: &SignInMethod) -> Result<AuthenticatedUser, AuthError> {
        self.state.send_replace(AuthState::AuthPending);
        match self.provider.sign_in(method).await {
            Ok(user) => {
                info!(
                    identity = %user.identity,
                    anonymous = user.is_anonymous,
                    "auth: signed in"
                );
                self.state.send_replace(AuthState::Authenticated(user.clone()));
                Ok(user)
            }
            Err(err) => {
                warn!(error = %err, "auth: sign-in failed");
                self.state.send_replace(AuthState::Unauthenticated);
                Err(err)
            }
        }
    }

    /// Replaces the current user's ID token without changing identity, so an
    /// attached listener stays in place.
    pub async fn refresh(&self) -> Result<AuthenticatedUser, AuthError> {
        let current = self.current_user().ok_or(AuthError::NotSignedIn)?;
        let refreshed = self.provider.refresh(&current).await?;
        if refreshed.identity != current.identity {
            return Err(AuthError::Rejected(format!(
                "refresh returned identity {} for {}",
                refreshed.identity, current.identity
            )));
        }
        let applied = self.state.send_if_modified(|state| match state {
            AuthState::Authenticated(user) if user.identity == refreshed.identity => {
                *user = refreshed.clone();
                true
            }
            _ => false,
        });
        if !applied {
            return Err(AuthError::NotSignedIn);
        }
        debug!(identity = %refreshed.identity, "auth: id token refreshed");
        Ok(refreshed)
    }

    pub fn sign_out(&self) {
        let previous = self.state.send_replace(AuthState::Unauthenticated);
        if let Some(identity) = previous.identity() {
            info!(%identity, "auth: signed out");
        }
    }
}
