use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use server_api::{
    add_document, auth::AuthConfig, authenticate, delete_document, list_documents,
    parse_collection_path, refresh_session, sign_in_anonymously, sign_in_with_custom_token,
    ApiContext,
};
use shared::{
    domain::{CollectionPath, DocumentId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddDocumentResponse, CustomTokenSignInRequest, RefreshSessionRequest, SignInResponse,
        StoredDocument,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod listen;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct ListenQuery {
    path: String,
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        auth: AuthConfig {
            id_token_secret: settings.id_token_secret,
            custom_token_secret: settings.custom_token_secret,
            id_token_ttl_seconds: settings.id_token_ttl_seconds,
        },
    };
    let (changes, _) = broadcast::channel(256);

    let app = build_router(Arc::new(AppState { api, changes }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "store service listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/anonymous", post(http_sign_in_anonymously))
        .route("/auth/custom_token", post(http_sign_in_with_custom_token))
        .route("/auth/refresh", post(http_refresh_session))
        .route(
            "/v1/users/:uid/:collection",
            get(http_list_documents).post(http_add_document),
        )
        .route(
            "/v1/users/:uid/:collection/:doc_id",
            delete(http_delete_document),
        )
        .route("/v1/listen", get(ws_listen))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.api.storage.health_check().await.map_err(|e| {
        reject(ApiError::new(ErrorCode::Internal, e.to_string()))
    })?;
    Ok("ok")
}

async fn http_sign_in_anonymously(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SignInResponse>> {
    let session = sign_in_anonymously(&state.api).await.map_err(reject)?;
    Ok(Json(session))
}

async fn http_sign_in_with_custom_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CustomTokenSignInRequest>,
) -> ApiResult<Json<SignInResponse>> {
    let session = sign_in_with_custom_token(&state.api, &req.token)
        .await
        .map_err(reject)?;
    Ok(Json(session))
}

async fn http_refresh_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshSessionRequest>,
) -> ApiResult<Json<SignInResponse>> {
    let session = refresh_session(&state.api, &req.id_token)
        .await
        .map_err(reject)?;
    Ok(Json(session))
}

async fn http_list_documents(
    State(state): State<Arc<AppState>>,
    Path((uid, collection)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<StoredDocument>>> {
    let identity = authenticate(&state.api, bearer_token(&headers)).map_err(reject)?;
    let path = parse_collection_path(&uid, &collection).map_err(reject)?;
    let documents = list_documents(&state.api, &identity, &path)
        .await
        .map_err(reject)?;
    Ok(Json(documents))
}

async fn http_add_document(
    State(state): State<Arc<AppState>>,
    Path((uid, collection)): Path<(String, String)>,
    headers: HeaderMap,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<(StatusCode, Json<AddDocumentResponse>)> {
    let identity = authenticate(&state.api, bearer_token(&headers)).map_err(reject)?;
    let path = parse_collection_path(&uid, &collection).map_err(reject)?;
    let stored = add_document(&state.api, &identity, &path, data)
        .await
        .map_err(reject)?;
    notify_changed(&state, &path);
    Ok((
        StatusCode::CREATED,
        Json(AddDocumentResponse {
            id: stored.id,
            create_time: stored.create_time,
        }),
    ))
}

async fn http_delete_document(
    State(state): State<Arc<AppState>>,
    Path((uid, collection, doc_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let identity = authenticate(&state.api, bearer_token(&headers)).map_err(reject)?;
    let path = parse_collection_path(&uid, &collection).map_err(reject)?;
    delete_document(&state.api, &identity, &path, &DocumentId(doc_id))
        .await
        .map_err(reject)?;
    notify_changed(&state, &path);
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_listen(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListenQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = q
        .token
        .clone()
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let identity = authenticate(&state.api, token.as_deref());
    let path = CollectionPath::parse(&q.path)
        .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string()));
    ws.on_upgrade(move |socket| listen::serve_listener(state, socket, identity, path))
}

fn notify_changed(state: &AppState, path: &CollectionPath) {
    // No receivers just means nobody is listening right now.
    let _ = state.changes.send(path.to_string());
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
