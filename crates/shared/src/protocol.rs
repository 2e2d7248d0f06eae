use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{DesignMode, DocumentId, Identity},
    error::ApiError,
};

/// Field layout of an approved design document as written to the store.
///
/// `mode` is optional on read: documents written before modes existed carry
/// no classification and are shown as the default mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignRecord {
    pub prompt: String,
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DesignMode>,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl DesignRecord {
    pub fn into_document_data(self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub id: DocumentId,
    pub create_time: DateTime<Utc>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDocumentResponse {
    pub id: DocumentId,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTokenSignInRequest {
    pub token: String,
}

/// Exchanges a possibly expired ID token for a fresh one with the same identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSessionRequest {
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    pub identity: Identity,
    pub id_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// Frames pushed over the listen socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ListenEvent {
    Snapshot {
        path: String,
        documents: Vec<StoredDocument>,
    },
    Error(ApiError),
}
