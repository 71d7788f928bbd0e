use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::classroom::{ClassroomSession, RoomRegistry};

/// Drives one connection from upgrade to disconnect.
///
/// The socket is split: a spawned task forwards envelopes from the session's
/// outbound channel to the write half, so delivery to this connection never
/// blocks message ingestion from any other. The receive loop feeds the
/// session; cleanup runs whether the client closed, the transport failed, or
/// the relay told the connection to go away.
pub async fn handle_classroom_websocket(
    websocket: WebSocket,
    registry: Arc<RoomRegistry>,
    room_code: String,
) {
    tracing::info!(room = %room_code, "New classroom WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_sender.send(message).await {
                tracing::debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut session = ClassroomSession::connect(registry, room_code, tx).await;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                if let Ok(text) = message.to_str() {
                    session.handle_text(text).await;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.disconnect().await;
    sender_task.abort();
    tracing::info!("Classroom WebSocket connection closed");
}
