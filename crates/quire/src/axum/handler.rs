use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Admission, CollabState};
use crate::config::{Framing, ViolationPolicy};
use crate::protocol::{
    decode_message, decode_text, encode_message, encode_text, ClientId, ClientMessage,
    ServerMessage,
};
use crate::session::{Admitted, ClientConnection, Outbound, SessionHandle, UserInfo};
use crate::storage::Profile;
use crate::{QuireError, QuireResult};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Bridges one WebSocket connection to the session of its document
pub struct WebSocketHandler {
    socket: WebSocket,
    state: CollabState,
    doc_id: String,
    admission: Admission,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, state: CollabState, doc_id: String, admission: Admission) -> Self {
        Self {
            socket,
            state,
            doc_id,
            admission,
        }
    }

    /// Handle the WebSocket connection until either side closes it
    pub async fn handle(self) {
        let Self {
            mut socket,
            state,
            doc_id,
            admission,
        } = self;

        let profile = match state.storage().get_profile(&admission.user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("No profile for user {}: {}", admission.user_id, e);
                Profile {
                    display_name: admission.user_id.clone(),
                    avatar: None,
                }
            }
        };
        let user = UserInfo {
            id: admission.user_id,
            name: profile.display_name,
            avatar: profile.avatar,
        };

        let (connection, mut outbox) = ClientConnection::new(user, admission.editable);
        // Kept so the adapter can answer malformed frames itself
        let local = connection.outbox.clone();
        let user_id = connection.user.id.clone();

        let Admitted { client_id, session } = match state.manager().connect(&doc_id, connection).await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                error!("User {} could not join document '{}': {}", user_id, doc_id, e);
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        info!(
            "WebSocket connection established for client {} ({}) on document '{}'",
            client_id, user_id, doc_id
        );

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let framing = state.config().framing;
        let keepalive = state.config().keepalive_interval().max(Duration::from_millis(1));
        // Time of the last frame read from the peer, pongs included
        let (seen_tx, last_seen) = watch::channel(Instant::now());

        // Spawn task to send messages and keepalive pings to the WebSocket
        let mut sender_task = tokio::spawn(async move {
            let mut ping = interval_at(Instant::now() + keepalive, keepalive);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    outbound = outbox.recv() => match outbound {
                        Some(Outbound::Message(message)) => {
                            let frame = match encode_frame(&message, framing) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    error!("Failed to encode message for client {}: {}", client_id, e);
                                    continue;
                                }
                            };
                            if let Err(e) = ws_sender.send(frame).await {
                                warn!("Failed to send WebSocket message to client {}: {}", client_id, e);
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            debug!("Session dropped client {}, closing connection", client_id);
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        let silent = last_seen.borrow().elapsed();
                        if silent > keepalive * 2 {
                            warn!(
                                "Client {} silent for {:?}, closing connection",
                                client_id, silent
                            );
                            let _ = timeout(keepalive, ws_sender.send(Message::Close(None))).await;
                            break;
                        }
                        if let Err(e) = ws_sender.send(Message::Ping(Bytes::new())).await {
                            warn!("Keepalive to client {} failed: {}", client_id, e);
                            break;
                        }
                    }
                }
            }
            debug!("Sender task ended for client {}", client_id);
        });

        // Handle incoming messages from the WebSocket
        let mut receiver_task = {
            let session = session.clone();
            let policy = state.config().violation_policy;
            let editable = admission.editable;

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    seen_tx.send_replace(Instant::now());
                    let message = match msg {
                        Ok(Message::Text(text)) => decode_text::<ClientMessage>(text.as_str()),
                        Ok(Message::Binary(data)) => decode_message::<ClientMessage>(&data),
                        Ok(Message::Close(_)) => {
                            info!("Client {} closed connection normally", client_id);
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                        Err(e) => {
                            warn!("WebSocket error for client {}: {}", client_id, e);
                            break;
                        }
                    };

                    let result = match message {
                        Ok(message) => forward(&session, client_id, editable, message).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_violation() => match policy {
                            ViolationPolicy::Disconnect => {
                                warn!("Disconnecting client {}: {}", client_id, e);
                                break;
                            }
                            ViolationPolicy::Reject => {
                                warn!("Rejecting frame from client {}: {}", client_id, e);
                                let _ = local.send(Outbound::Message(ServerMessage::Error {
                                    message: e.to_string(),
                                }));
                            }
                        },
                        Err(e) => {
                            error!("Error handling message from client {}: {}", client_id, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for client {}", client_id);
            })
        };

        // Wait for either task to complete (indicating connection should close)
        let sender_done = tokio::select! {
            _ = &mut sender_task => {
                receiver_task.abort();
                true
            }
            _ = &mut receiver_task => false,
        };
        let completion_reason = if sender_done {
            "sender task completed"
        } else {
            "receiver task completed"
        };

        info!(
            "WebSocket connection ending for client {} on '{}' ({})",
            client_id, doc_id, completion_reason
        );

        if let Err(e) = session.remove_client(client_id).await {
            debug!("Session already gone when removing client {}: {}", client_id, e);
        }

        // Once detached, the outbox closes and the sender sends a close frame
        if !sender_done && timeout(CLOSE_GRACE, &mut sender_task).await.is_err() {
            sender_task.abort();
        }
    }
}

/// Hand a decoded frame to the session
async fn forward(
    session: &SessionHandle,
    client_id: ClientId,
    editable: bool,
    message: ClientMessage,
) -> QuireResult<()> {
    match message {
        ClientMessage::Op(base_revision, operations, selection) => {
            if !editable {
                return Err(QuireError::PermissionViolation {
                    client_id: client_id.0,
                });
            }
            session
                .submit_edit(client_id, base_revision, operations, selection)
                .await
        }
        ClientMessage::Sel(selection) => session.submit_selection(client_id, selection).await,
    }
}

fn encode_frame(message: &ServerMessage, framing: Framing) -> QuireResult<Message> {
    Ok(match framing {
        Framing::Text => Message::Text(encode_text(message)?.into()),
        Framing::Lib0 => Message::Binary(encode_message(message)?.into()),
    })
}
