use serde_json::{Map, Value};
use shared::{
    domain::{CollectionPath, DocumentId, Identity},
    error::{ApiError, ErrorCode},
    protocol::{ListenEvent, SignInResponse, StoredDocument},
};
use storage::Storage;
use tracing::{info, warn};

pub mod auth;

use auth::{
    mint_id_token, verify_custom_token, verify_id_token, verify_id_token_for_refresh, AuthConfig,
};

const MAX_DOCUMENT_FIELDS: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

pub async fn sign_in_anonymously(ctx: &ApiContext) -> Result<SignInResponse, ApiError> {
    let identity = Identity(format!("anon-{}", uuid::Uuid::new_v4().simple()));
    ctx.storage
        .upsert_user(&identity, true)
        .await
        .map_err(internal)?;
    info!(%identity, "auth: anonymous sign-in");
    issue_session(ctx, identity, true)
}

pub async fn sign_in_with_custom_token(
    ctx: &ApiContext,
    token: &str,
) -> Result<SignInResponse, ApiError> {
    let claims = verify_custom_token(&ctx.auth, token).map_err(|err| {
        warn!(%err, "auth: custom token rejected");
        ApiError::new(ErrorCode::Unauthorized, "custom token rejected")
    })?;
    if claims.uid.trim().is_empty() || claims.uid.contains('/') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "custom token uid must be a non-empty path segment",
        ));
    }
    let identity = Identity(claims.uid);
    ctx.storage
        .upsert_user(&identity, false)
        .await
        .map_err(internal)?;
    info!(%identity, "auth: custom token sign-in");
    issue_session(ctx, identity, false)
}

/// Re-issues an ID token for an identity this service already knows.
pub async fn refresh_session(
    ctx: &ApiContext,
    id_token: &str,
) -> Result<SignInResponse, ApiError> {
    let verified = verify_id_token_for_refresh(&ctx.auth, id_token).map_err(|err| {
        warn!(%err, "auth: refresh rejected");
        ApiError::new(ErrorCode::Unauthorized, "id token cannot be refreshed")
    })?;
    let user = ctx
        .storage
        .load_user(&verified.identity)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Unauthorized,
                format!("unknown identity {}", verified.identity),
            )
        })?;
    info!(identity = %user.identity, "auth: session refreshed");
    issue_session(ctx, user.identity, user.is_anonymous)
}

pub fn authenticate(ctx: &ApiContext, id_token: Option<&str>) -> Result<Identity, ApiError> {
    let token = id_token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "missing id token"))?;
    verify_id_token(&ctx.auth, token)
        .map(|verified| verified.identity)
        .map_err(|err| ApiError::new(ErrorCode::Unauthorized, format!("invalid id token: {err}")))
}

/// Only the owning identity may read or write `users/{uid}/**`.
pub fn authorize_path(identity: &Identity, path: &CollectionPath) -> Result<(), ApiError> {
    if path.owner() != identity {
        return Err(ApiError::new(
            ErrorCode::PermissionDenied,
            format!("missing or insufficient permissions for {path}"),
        ));
    }
    Ok(())
}

pub fn parse_collection_path(owner: &str, collection: &str) -> Result<CollectionPath, ApiError> {
    CollectionPath::new(Identity(owner.to_string()), collection)
        .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string()))
}

pub async fn add_document(
    ctx: &ApiContext,
    identity: &Identity,
    path: &CollectionPath,
    data: Map<String, Value>,
) -> Result<StoredDocument, ApiError> {
    authorize_path(identity, path)?;
    if data.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "document has no fields"));
    }
    if data.len() > MAX_DOCUMENT_FIELDS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("document exceeds {MAX_DOCUMENT_FIELDS} fields"),
        ));
    }
    let stored = ctx
        .storage
        .add_document(path, &data)
        .await
        .map_err(internal)?;
    info!(%path, doc_id = %stored.id, "store: document added");
    Ok(stored)
}

pub async fn delete_document(
    ctx: &ApiContext,
    identity: &Identity,
    path: &CollectionPath,
    id: &DocumentId,
) -> Result<(), ApiError> {
    authorize_path(identity, path)?;
    let removed = ctx
        .storage
        .delete_document(path, id)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("no document {id} in {path}"),
        ));
    }
    info!(%path, doc_id = %id, "store: document deleted");
    Ok(())
}

pub async fn list_documents(
    ctx: &ApiContext,
    identity: &Identity,
    path: &CollectionPath,
) -> Result<Vec<StoredDocument>, ApiError> {
    authorize_path(identity, path)?;
    ctx.storage.list_documents(path).await.map_err(internal)
}

/// Builds the frame a listener on `path` should receive right now.
pub async fn snapshot_event(
    ctx: &ApiContext,
    identity: &Identity,
    path: &CollectionPath,
) -> ListenEvent {
    match list_documents(ctx, identity, path).await {
        Ok(documents) => ListenEvent::Snapshot {
            path: path.to_string(),
            documents,
        },
        Err(err) => ListenEvent::Error(err),
    }
}

fn issue_session(
    ctx: &ApiContext,
    identity: Identity,
    is_anonymous: bool,
) -> Result<SignInResponse, ApiError> {
    let issued = mint_id_token(&ctx.auth, &identity, is_anonymous)
        .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string()))?;
    Ok(SignInResponse {
        identity,
        id_token: issued.token,
        expires_at: issued.expires_at,
        is_anonymous,
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::mint_custom_token;
    use serde_json::json;

    async fn setup() -> ApiContext {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        ApiContext {
            storage,
            auth: AuthConfig {
                id_token_secret: "id".into(),
                custom_token_secret: "custom".into(),
                id_token_ttl_seconds: 60,
            },
        }
    }

    fn design_data() -> Map<String, Value> {
        match json!({ "prompt": "kimono", "style": "Minimalist" }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn anonymous_sign_in_issues_verifiable_token() {
        let ctx = setup().await;
        let session = sign_in_anonymously(&ctx).await.expect("sign in");
        assert!(session.identity.as_str().starts_with("anon-"));
        assert!(session.is_anonymous);

        let identity = authenticate(&ctx, Some(&session.id_token)).expect("authenticate");
        assert_eq!(identity, session.identity);
    }

    #[tokio::test]
    async fn custom_token_with_wrong_secret_is_unauthorized() {
        let ctx = setup().await;
        let forged = mint_custom_token("not-the-secret", "designer", 60).expect("token");
        let err = sign_in_with_custom_token(&ctx, &forged)
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let token = mint_custom_token("custom", "designer", 60).expect("token");
        let session = sign_in_with_custom_token(&ctx, &token)
            .await
            .expect("sign in");
        assert_eq!(session.identity, Identity::from("designer"));
        assert!(!session.is_anonymous);
    }

    #[tokio::test]
    async fn refresh_keeps_identity_of_known_users_only() {
        let ctx = setup().await;
        let session = sign_in_anonymously(&ctx).await.expect("sign in");
        let refreshed = refresh_session(&ctx, &session.id_token)
            .await
            .expect("refresh");
        assert_eq!(refreshed.identity, session.identity);
        assert!(refreshed.is_anonymous);
        authenticate(&ctx, Some(&refreshed.id_token)).expect("fresh token verifies");

        let stranger =
            mint_id_token(&ctx.auth, &Identity::from("never-signed-in"), false).expect("token");
        let err = refresh_session(&ctx, &stranger.token)
            .await
            .expect_err("unknown identity");
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let err = refresh_session(&ctx, "garbage")
            .await
            .expect_err("garbage token");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let ctx = setup().await;
        let err = authenticate(&ctx, None).expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Unauthorized);
        let err = authenticate(&ctx, Some("garbage")).expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn cross_identity_access_is_permission_denied() {
        let ctx = setup().await;
        let path = CollectionPath::approved_designs(&Identity::from("alice")).expect("path");
        let err = add_document(&ctx, &Identity::from("mallory"), &path, design_data())
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        let event = snapshot_event(&ctx, &Identity::from("mallory"), &path).await;
        assert!(matches!(
            event,
            ListenEvent::Error(ApiError {
                code: ErrorCode::PermissionDenied,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn deleting_a_missing_document_is_not_found() {
        let ctx = setup().await;
        let alice = Identity::from("alice");
        let path = CollectionPath::approved_designs(&alice).expect("path");
        let err = delete_document(&ctx, &alice, &path, &DocumentId::from("nope"))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn snapshot_reflects_adds_and_deletes() {
        let ctx = setup().await;
        let alice = Identity::from("alice");
        let path = CollectionPath::approved_designs(&alice).expect("path");
        let stored = add_document(&ctx, &alice, &path, design_data())
            .await
            .expect("add");

        match snapshot_event(&ctx, &alice, &path).await {
            ListenEvent::Snapshot { documents, .. } => assert_eq!(documents.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }

        delete_document(&ctx, &alice, &path, &stored.id)
            .await
            .expect("delete");
        match snapshot_event(&ctx, &alice, &path).await {
            ListenEvent::Snapshot { documents, .. } => assert!(documents.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_documents_are_rejected() {
        let ctx = setup().await;
        let alice = Identity::from("alice");
        let path = CollectionPath::approved_designs(&alice).expect("path");
        let err = add_document(&ctx, &alice, &path, Map::new())
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
