use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::RlcState;
use crate::connection::ConnectionHandle;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::RlcError;

/// Handles the WebSocket connection of a single client
pub struct WebSocketHandler {
    socket: WebSocket,
    state: RlcState,
    pool_id: Option<String>,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, state: RlcState, pool_id: Option<String>) -> Self {
        Self {
            socket,
            state,
            pool_id,
        }
    }

    /// Handle the WebSocket connection until either side closes it
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();

        // Messages for this client go through a channel to the writer task
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let connection_id = Uuid::new_v4().to_string();
        let connections = self.state.connections().clone();
        let handle: Arc<dyn ConnectionHandle> = Arc::new(tx);

        if let Err(e) =
            connections.register_connection(handle, connection_id.clone(), self.pool_id.as_deref())
        {
            warn!("Rejected WebSocket connection: {}", e);
            let rejection = ServerMessage::error(&e, None, None);
            if let Ok(encoded) = encode_message(&rejection) {
                let _ = ws_sender.send(Message::Binary(encoded.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }

        info!(
            "New WebSocket connection established for connection {}",
            connection_id
        );

        // Spawn task to send messages to the WebSocket
        let sender_task = {
            let connection_id = connection_id.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    match encode_message(&message) {
                        Ok(encoded) => {
                            if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                error!(
                                    "Failed to send WebSocket message to connection {}: {}",
                                    connection_id, e
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            error!(
                                "Failed to encode message for connection {}: {}",
                                connection_id, e
                            );
                        }
                    }
                }
                debug!("Sender task ended for connection {}", connection_id);
            })
        };

        // Handle incoming messages from the WebSocket
        let receiver_task = {
            let state = self.state.clone();
            let connection_id = connection_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if let Err(e) = handle_frame(&state, &connection_id, &data).await {
                                warn!(
                                    "Undecodable message from connection {}: {}",
                                    connection_id, e
                                );
                                reply_protocol_error(&state, &connection_id, e);
                            }
                        }
                        Ok(Message::Text(text)) => {
                            // JSON text frames are accepted alongside lib0 binary frames
                            match serde_json::from_str::<ClientMessage>(text.as_str()) {
                                Ok(message) => {
                                    state
                                        .runtime()
                                        .handle_client_message(&connection_id, message)
                                        .await
                                }
                                Err(e) => {
                                    warn!(
                                        "Invalid text message from connection {}: {}",
                                        connection_id, e
                                    );
                                    reply_protocol_error(&state, &connection_id, e.into());
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!("Connection {} closed normally", connection_id);
                            break;
                        }
                        Ok(Message::Ping(_)) => {
                            // Axum answers pings itself
                            debug!("Received ping from connection {}", connection_id);
                            record_activity(&state, &connection_id);
                        }
                        Ok(Message::Pong(_)) => {
                            debug!("Received pong from connection {}", connection_id);
                            record_activity(&state, &connection_id);
                        }
                        Err(e) => {
                            warn!("WebSocket error for connection {}: {}", connection_id, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for connection {}", connection_id);
            })
        };

        // Wait for either task to complete (indicating connection should close)
        let completion_reason = join_first(sender_task, receiver_task).await;

        info!(
            "WebSocket connection ending for connection {} ({})",
            connection_id, completion_reason
        );

        // Closing publishes the event the runtime uses to suspend or destroy
        // the components this connection owned
        match connections.unregister_connection(&connection_id) {
            Ok(()) => info!(
                "Connection {} fully disconnected and cleaned up",
                connection_id
            ),
            // Already removed by the health monitor
            Err(e) => debug!("Connection {} already cleaned up: {}", connection_id, e),
        }
    }
}

/// Wait for the first connection task to end and abort the other
async fn join_first(mut sender_task: JoinHandle<()>, mut receiver_task: JoinHandle<()>) -> &'static str {
    tokio::select! {
        _ = &mut sender_task => {
            receiver_task.abort();
            "sender task completed"
        }
        _ = &mut receiver_task => {
            sender_task.abort();
            "receiver task completed"
        }
    }
}

/// Decode a binary frame and hand it to the runtime
async fn handle_frame(state: &RlcState, connection_id: &str, data: &[u8]) -> crate::RlcResult<()> {
    let message: ClientMessage = decode_message(data)?;
    state
        .runtime()
        .handle_client_message(connection_id, message)
        .await;
    Ok(())
}

fn reply_protocol_error(state: &RlcState, connection_id: &str, err: RlcError) {
    let err = match err {
        err @ RlcError::Protocol { .. } => err,
        other => RlcError::Protocol {
            message: other.to_string(),
        },
    };
    state.connections().send_message(
        ServerMessage::error(&err, None, None),
        crate::connection::SendTarget::Connection(connection_id.to_string()),
        crate::connection::Delivery::Queued,
    );
}

fn record_activity(state: &RlcState, connection_id: &str) {
    if let Err(e) = state.connections().record_activity(connection_id) {
        debug!("Activity on unknown connection: {}", e);
    }
}
