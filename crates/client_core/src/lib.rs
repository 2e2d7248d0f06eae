pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod persistence;
pub mod retry;
pub mod store;
pub mod studio;
pub mod sync;
pub mod types;

pub use auth::{AuthSession, AuthState, AuthenticatedUser, SignInMethod};
pub use config::{load_client_config, ClientConfig};
pub use context::StudioContext;
pub use error::{AuthError, GenerationError, StoreError, StudioError};
pub use generation::{GenerationTarget, ImageClient};
pub use persistence::DesignController;
pub use retry::RetryPolicy;
pub use store::{DocumentStore, ListenerRegistration, SnapshotEvent};
pub use studio::{StaleResponsePolicy, StudioSession};
pub use sync::{DesignListState, SyncAdapter, SyncHandle, SyncPhase};
pub use types::{ApprovedDesign, GeneratedImage, GenerationRequest, ReferenceImage};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
