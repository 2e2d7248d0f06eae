use server_api::ApiContext;
use tokio::sync::broadcast;

/// Collection paths whose contents changed; listeners re-snapshot on receipt.
pub(crate) type ChangeFeed = broadcast::Sender<String>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) changes: ChangeFeed,
}
