use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::{
    error::Result,
    models::principal::Principal,
    services::events::EventStream,
    state::AppState,
};

/// Upgrades to a WebSocket that streams one session's events.
///
/// The subscription is taken before the upgrade so that an unknown session
/// or an unauthorized caller gets a plain HTTP error.
#[axum::debug_handler]
pub async fn session_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
) -> Result<Response> {
    let events = state
        .attendance
        .subscribe(session_id, principal.user_id)
        .await?;

    tracing::debug!("👀 {} observing session {}", principal.user_id, session_id);
    Ok(ws.on_upgrade(move |socket| forward_events(socket, events)))
}

/// Pushes events to the socket until the session closes or the client leaves.
async fn forward_events(socket: WebSocket, mut events: EventStream) {
    let session_id = events.session_id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let frame = match sonic_rs::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("❌ Failed to encode event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("👋 Observer of session {} disconnected", session_id);
}
