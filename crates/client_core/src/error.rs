use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no generation api key configured")]
    MissingApiKey,
    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation response is not valid json: {0}")]
    Decode(String),
    #[error("generation response carried no image payload")]
    MissingImage,
    #[error("generation failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    /// Transport and payload-shape failures are worth another attempt;
    /// configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            GenerationError::MissingApiKey | GenerationError::Exhausted { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("sign-in rejected: {0}")]
    Rejected(String),
    #[error("auth request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection is not ready")]
    NotReady,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store listen failed: {0}")]
    Listen(String),
    #[error("invalid store payload: {0}")]
    Decode(String),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

impl From<ApiError> for StoreError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::PermissionDenied => StoreError::PermissionDenied(value.message),
            ErrorCode::NotFound => StoreError::NotFound(value.message),
            ErrorCode::Unauthorized => StoreError::Unauthorized(value.message),
            ErrorCode::Validation | ErrorCode::Internal => StoreError::Rejected(value.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
}
