use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::retry::{RetryPolicy, DEFAULT_RETRY_DELAYS_SECS};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "imagen-3.0-generate-002";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";
pub const DEFAULT_STORE_URL: &str = "http://127.0.0.1:8787";

/// Everything the client needs at process start: the generation API key and
/// the store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub generation: GenerationSettings,
    pub retry: RetrySettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub sample_count: u32,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            sample_count: 1,
            request_timeout_secs: 120,
        }
    }
}

impl GenerationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub delays_secs: Vec<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            delays_secs: DEFAULT_RETRY_DELAYS_SECS.to_vec(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(&self.delays_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub server_url: String,
    pub custom_token: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_STORE_URL.to_string(),
            custom_token: None,
        }
    }
}

/// Loads `studio.toml` (or `path` when given) and `STUDIO__*` environment
/// overrides. A missing api key falls back to `GEMINI_API_KEY` /
/// `GOOGLE_API_KEY`.
pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig, config::ConfigError> {
    let file = match path {
        Some(path) => config::File::from(path.to_path_buf()).required(true),
        None => config::File::with_name("studio").required(false),
    };
    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("STUDIO")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("retry.delays_secs")
                .try_parsing(true),
        )
        .build()?;

    let mut cfg: ClientConfig = settings.try_deserialize()?;
    cfg.api_key = cfg
        .api_key
        .take()
        .filter(|key| !key.trim().is_empty())
        .or_else(|| non_empty_env("GEMINI_API_KEY"))
        .or_else(|| non_empty_env("GOOGLE_API_KEY"));
    cfg.store.server_url = cfg.store.server_url.trim().trim_end_matches('/').to_string();
    cfg.generation.api_base = cfg
        .generation
        .api_base
        .trim()
        .trim_end_matches('/')
        .to_string();
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
