use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde_json::{Map, Value};
use shared::{
    domain::{CollectionPath, DocumentId},
    error::{ApiError, ErrorCode},
    protocol::{AddDocumentResponse, ListenEvent},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{DocumentStore, ListenerRegistration, SnapshotEvent, LISTENER_BUFFER};
use crate::{auth::AuthenticatedUser, error::StoreError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Store client for the document service's REST and listen endpoints.
pub struct HttpDocumentStore {
    http: Client,
    base: Url,
    connect_timeout: Duration,
}

impl HttpDocumentStore {
    pub fn new(server_url: &str) -> Result<Self, StoreError> {
        let base = Url::parse(server_url.trim())
            .map_err(|err| StoreError::InvalidUrl(format!("{server_url}: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StoreError::InvalidUrl(format!(
                "{server_url}: scheme must be http or https"
            )));
        }
        Ok(Self {
            http: Client::new(),
            base,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Bounds the listen socket handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, path: &CollectionPath) -> Result<Url, StoreError> {
        self.endpoint(&["v1", "users", path.owner().as_str(), path.collection()])
    }

    fn listen_url(&self, user: &AuthenticatedUser, path: &CollectionPath) -> Result<Url, StoreError> {
        let mut url = self.endpoint(&["v1", "listen"])?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::InvalidUrl(self.base.to_string()))?;
        url.query_pairs_mut()
            .append_pair("path", &path.to_string())
            .append_pair("token", &user.id_token);
        Ok(url)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn add(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        data: Map<String, Value>,
    ) -> Result<DocumentId, StoreError> {
        let response = self
            .http
            .post(self.collection_url(path)?)
            .bearer_auth(&user.id_token)
            .json(&data)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let created: AddDocumentResponse = response
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        info!(%path, doc_id = %created.id, "store: document added");
        Ok(created.id)
    }

    async fn delete(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
        id: &DocumentId,
    ) -> Result<(), StoreError> {
        let mut url = self.collection_url(path)?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base.to_string()))?
            .push(id.as_str());
        let response = self
            .http
            .delete(url)
            .bearer_auth(&user.id_token)
            .send()
            .await?;
        ensure_success(response).await?;
        info!(%path, doc_id = %id, "store: document deleted");
        Ok(())
    }

    async fn listen(
        &self,
        user: &AuthenticatedUser,
        path: &CollectionPath,
    ) -> Result<ListenerRegistration, StoreError> {
        let url = self.listen_url(user, path)?;
        let handshake = connect_async(url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                StoreError::Listen(format!(
                    "listen socket handshake timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|err| StoreError::Listen(format!("failed to connect listen socket: {err}")))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ListenEvent>(&text) {
                        Ok(ListenEvent::Snapshot { documents, .. }) => {
                            SnapshotEvent::Snapshot(documents)
                        }
                        Ok(ListenEvent::Error(err)) => SnapshotEvent::Error(err),
                        Err(err) => {
                            warn!(path = %task_path, error = %err, "store: invalid listen frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx
                            .send(SnapshotEvent::Error(ApiError::new(
                                ErrorCode::Internal,
                                format!("listen socket failed: {err}"),
                            )))
                            .await;
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(path = %task_path, "store: listen socket closed");
        });
        info!(%path, "store: listener attached");
        Ok(ListenerRegistration::new(path.clone(), rx, task))
    }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(StoreError::from(err)),
        Err(_) => Err(StoreError::Rejected(format!("HTTP {status}: {body}"))),
    }
}
