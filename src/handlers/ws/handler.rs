//! Axum WebSocket handler
//!
//! This module contains the WebSocket upgrade handler and the per-connection
//! socket loop. The loop feeds client frames into the session's bridge and
//! relays bridge events back out over the socket, with binary audio bypassing
//! JSON serialization in both directions.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::bridge::{ClientChannel, ClientCommand, ClientEvent, ClientFrame};
use crate::core::registry::{RegistryError, Session, SessionId};
use crate::state::AppState;

use super::messages::{IncomingMessage, MessageRoute, OutgoingMessage};

/// Channel buffer size for the socket-facing channels
/// Larger buffer (1024 vs default 256) reduces contention in high-throughput scenarios
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// WebSocket voice session handler
/// Upgrades the HTTP connection and attaches it to an existing session
pub async fn ws_voice_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!(session_id = %id, "WebSocket voice connection upgrade requested");
    ws.on_upgrade(move |socket| handle_voice_socket(socket, SessionId::from(id), state))
}

/// Handle one WebSocket voice connection
/// This function manages the entire socket session against the bridge
async fn handle_voice_socket(socket: WebSocket, id: SessionId, app_state: Arc<AppState>) {
    let (frame_tx, frame_rx) = mpsc::channel::<ClientFrame>(CHANNEL_BUFFER_SIZE);
    let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(CHANNEL_BUFFER_SIZE);

    let channel = ClientChannel {
        frames: frame_rx,
        events: event_tx,
    };

    let session = match app_state.registry.attach(id, channel) {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id = %id, "WebSocket attach rejected: {}", e);
            reject_socket(socket, &e).await;
            return;
        }
    };

    info!(session_id = %id, "WebSocket voice connection established");

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    let (route_tx, mut route_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    // Spawn task to handle outgoing messages - simple and direct for low latency
    let sender_task = tokio::spawn(async move {
        while let Some(route) = route_rx.recv().await {
            let result = match route {
                MessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                MessageRoute::Binary(data) => sender.send(Message::Binary(data)).await,
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    loop {
        select! {
            msg_result = receiver.next() => {
                match msg_result {
                    Some(Ok(msg)) => {
                        let continue_processing =
                            process_message(msg, &session, &frame_tx, &route_tx).await;

                        if !continue_processing {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %id, "WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!(session_id = %id, "WebSocket connection closed by client");
                        break;
                    }
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        session.touch();
                        if route_tx.send(MessageRoute::from(event)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The bridge is done; whatever it queued is already
                        // in flight through the sender task.
                        debug!(session_id = %id, "Bridge finished, closing socket");
                        break;
                    }
                }
            }
        }
    }

    // Closing the frame channel tells a still-running bridge the client is
    // gone; the sender task drains any queued events before exiting.
    drop(frame_tx);
    drop(route_tx);
    let _ = sender_task.await;

    info!(session_id = %id, "WebSocket voice connection terminated");
}

/// Process one incoming WebSocket message
async fn process_message(
    msg: Message,
    session: &Arc<Session>,
    frame_tx: &mpsc::Sender<ClientFrame>,
    route_tx: &mpsc::Sender<MessageRoute>,
) -> bool {
    match msg {
        Message::Binary(data) => {
            session.touch();
            frame_tx.send(ClientFrame::Audio(data)).await.is_ok()
        }
        Message::Text(text) => {
            debug!("Received text message: {} bytes", text.len());
            session.touch();

            let incoming: IncomingMessage = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to parse incoming message: {}", e);
                    let _ = route_tx
                        .send(MessageRoute::Outgoing(OutgoingMessage::Error {
                            code: "invalid_message".to_string(),
                            message: format!("Invalid message format: {e}"),
                            recoverable: true,
                        }))
                        .await;
                    return true;
                }
            };

            let frame = match incoming {
                IncomingMessage::CommitTurn => ClientFrame::Control(ClientCommand::CommitTurn),
                IncomingMessage::End => ClientFrame::Control(ClientCommand::End),
            };
            frame_tx.send(frame).await.is_ok()
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Ping/Pong is handled automatically by axum
            true
        }
        Message::Close(_) => {
            info!("WebSocket connection closed by client");
            false
        }
    }
}

/// Send one terminal error and close a connection that never attached.
async fn reject_socket(mut socket: WebSocket, err: &RegistryError) {
    let code = match err {
        RegistryError::NotFound(_) => "session_not_found",
        RegistryError::Conflict(_) => "session_busy",
        RegistryError::ResourceExhausted(_) => "too_many_sessions",
    };
    let message = OutgoingMessage::Error {
        code: code.to_string(),
        message: err.to_string(),
        recoverable: false,
    };
    if let Ok(json_str) = serde_json::to_string(&message) {
        let _ = socket.send(Message::Text(json_str.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
