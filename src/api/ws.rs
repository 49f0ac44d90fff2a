use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::AppState;

/// WebSocket endpoint streaming vehicle frames: one `snapshot` (when the
/// cached state is fresh enough), then every `update` in publication order.
/// The channel is read-only from the client's side.
pub async fn ws_vehicles(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let subscription = state.broadcaster.subscribe().await;
    let subscriber_id = subscription.id;
    debug!(subscriber = %subscriber_id, "websocket subscriber connected");

    // The snapshot goes out before the forward task starts, so it always
    // precedes any update on this connection. A stale or absent snapshot is
    // simply skipped; the client waits for the next update.
    if let Some(snapshot) = &subscription.snapshot {
        if let Ok(json) = serde_json::to_string(snapshot) {
            if sender.send(Message::Text(json.into())).await.is_err() {
                state.broadcaster.unsubscribe();
                return;
            }
        }
    }

    let mut frames = subscription.frames;
    let broadcaster = state.broadcaster.clone();
    let forward_task = tokio::spawn(async move {
        let mut lossy = false;
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let Ok(json) = serde_json::to_string(frame.as_ref()) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    // The ring already dropped this subscriber's oldest
                    // frames; flag it once and continue with the newest
                    if !lossy {
                        lossy = true;
                        broadcaster.mark_lossy();
                    }
                    warn!(
                        subscriber = %subscriber_id,
                        dropped,
                        "slow subscriber lost oldest frames"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Watch the incoming side only to notice disconnects promptly
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
    state.broadcaster.unsubscribe();
    debug!(subscriber = %subscriber_id, "websocket subscriber disconnected");
}
