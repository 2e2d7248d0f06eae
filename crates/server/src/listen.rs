use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use server_api::snapshot_event;
use shared::{
    domain::{CollectionPath, Identity},
    error::ApiError,
    protocol::ListenEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Streams full snapshots of `path` to one socket: once on connect and again
/// after every change to that collection. Rejected listeners get a single
/// error frame and stay connected until the client hangs up.
pub(crate) async fn serve_listener(
    state: Arc<AppState>,
    socket: WebSocket,
    identity: Result<Identity, ApiError>,
    path: Result<CollectionPath, ApiError>,
) {
    let (mut sender, mut receiver) = socket.split();

    let (identity, path) = match (identity, path) {
        (Ok(identity), Ok(path)) => (identity, path),
        (Err(err), _) | (_, Err(err)) => {
            warn!(code = ?err.code, message = %err.message, "listen: rejected listener");
            let _ = send_event(&mut sender, &ListenEvent::Error(err)).await;
            while let Some(Ok(_msg)) = receiver.next().await {}
            return;
        }
    };

    info!(%identity, %path, "listen: listener attached");
    let mut changes = state.changes.subscribe();
    let watched = path.to_string();

    let send_task = tokio::spawn(async move {
        let initial = snapshot_event(&state.api, &identity, &path).await;
        if send_event(&mut sender, &initial).await.is_err() {
            return;
        }
        loop {
            match changes.recv().await {
                Ok(changed) if changed == watched => {}
                Ok(_) => continue,
                // Missed notifications collapse into one fresh snapshot.
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, path = %watched, "listen: change feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
            let event = snapshot_event(&state.api, &identity, &path).await;
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!("listen: listener released");
}

async fn send_event<S>(sender: &mut S, event: &ListenEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
