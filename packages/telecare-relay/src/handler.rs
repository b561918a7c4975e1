//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them through the relay state, and sending responses.
//!
//! The relay has no call semantics. Every call message is a
//! connection-addressed, at-most-once forward; the only server-side
//! judgement is the presence lookup behind `CallUser`.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message to bind the connection to a user id
/// 2. Spawns a sender task to forward outbound messages
/// 3. Processes incoming messages until the connection closes
/// 4. On close, removes presence and notifies any in-call peer
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let user_id = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Register { user_id }) => {
                        if user_id.trim().is_empty() {
                            let err = ServerMessage::Error {
                                message: "Empty user id".to_string(),
                            };
                            let _ = ws_sender
                                .send(Message::Text(serde_json::to_string(&err).unwrap()))
                                .await;
                            continue;
                        }

                        // Send registration confirmation with the assigned
                        // connection id
                        let ack = ServerMessage::Registered {
                            user_id: user_id.clone(),
                            connection_id: connection_id.clone(),
                        };
                        if ws_sender
                            .send(Message::Text(serde_json::to_string(&ack).unwrap()))
                            .await
                            .is_err()
                        {
                            return; // Connection closed
                        }

                        break user_id;
                    }
                    Ok(ClientMessage::Ping) => {
                        let pong = ServerMessage::Pong;
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&pong).unwrap()))
                            .await;
                    }
                    Ok(_) => {
                        let err = ServerMessage::Error {
                            message: "Must register before sending other messages".to_string(),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse client message: {}", e);
                        let err = ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Presence ─────────────────────────────────────────

    state.register(&user_id, &connection_id, tx);

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(&state, &user_id, &connection_id, client_msg);
                    }
                    Err(e) => {
                        tracing::warn!(
                            user_id = user_id.as_str(),
                            error = %e,
                            "Failed to parse client message"
                        );
                        state.send_to_connection(
                            &connection_id,
                            ServerMessage::Error {
                                message: format!("Invalid message format: {}", e),
                            },
                        );
                    }
                }
            }
            Ok(Message::Ping(_data)) => {
                state.send_to_connection(&connection_id, ServerMessage::Pong);
            }
            Ok(Message::Close(_)) => {
                tracing::info!(user_id = user_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = user_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Pong: ignore
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    state.remove_connection(&connection_id);
    sender_task.abort();
    tracing::info!(
        user_id = user_id.as_str(),
        connection_id = connection_id.as_str(),
        "WebSocket disconnected"
    );
}

/// Handle a parsed client message.
fn handle_client_message(
    state: &RelayState,
    from_user_id: &str,
    from_connection_id: &str,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Register { .. } => {
            // Already registered; ignore duplicate registrations
            state.send_to_connection(
                from_connection_id,
                ServerMessage::Error {
                    message: "Already registered".to_string(),
                },
            );
        }

        ClientMessage::CallUser { to_user_id, offer } => {
            handle_call_user(state, from_user_id, from_connection_id, &to_user_id, &offer);
        }

        ClientMessage::MakeAnswer {
            to_connection_id,
            answer,
        } => {
            forward(
                state,
                &to_connection_id,
                ServerMessage::AnswerMade {
                    from_connection_id: from_connection_id.to_string(),
                    answer,
                },
            );
        }

        ClientMessage::RejectCall { to_connection_id } => {
            state.unlink_call_pair(from_connection_id, &to_connection_id);
            forward(
                state,
                &to_connection_id,
                ServerMessage::CallRejected {
                    from_connection_id: from_connection_id.to_string(),
                },
            );
        }

        ClientMessage::Candidate {
            to_connection_id,
            candidate,
        } => {
            forward(
                state,
                &to_connection_id,
                ServerMessage::CandidateReceived {
                    from_connection_id: from_connection_id.to_string(),
                    candidate,
                },
            );
        }

        ClientMessage::EndCall { to_connection_id } => {
            state.unlink_call_pair(from_connection_id, &to_connection_id);
            forward(
                state,
                &to_connection_id,
                ServerMessage::CallEnded {
                    from_connection_id: from_connection_id.to_string(),
                },
            );
        }

        ClientMessage::RecordOutcome {
            to_connection_id,
            record,
        } => {
            forward(
                state,
                &to_connection_id,
                ServerMessage::OutcomeRecorded {
                    from_connection_id: from_connection_id.to_string(),
                    record,
                },
            );
        }

        ClientMessage::Ping => {
            state.send_to_connection(from_connection_id, ServerMessage::Pong);
        }
    }
}

// ── Message Handlers ──────────────────────────────────────────────────────────

/// Start a call: presence lookup, then forward the offer. The lookup and
/// the forward run back to back with no await between them, so a
/// concurrent disconnect can at worst drop the forward (at-most-once).
fn handle_call_user(
    state: &RelayState,
    from_user_id: &str,
    from_connection_id: &str,
    to_user_id: &str,
    offer: &str,
) {
    let Some(to_connection_id) = state.lookup(to_user_id) else {
        tracing::debug!(
            from = from_user_id,
            to = to_user_id,
            "Call target unavailable"
        );
        state.send_to_connection(
            from_connection_id,
            ServerMessage::UserUnavailable {
                user_id: to_user_id.to_string(),
            },
        );
        return;
    };

    tracing::debug!(
        from = from_user_id,
        to = to_user_id,
        to_connection = to_connection_id.as_str(),
        "Forwarding call offer"
    );

    let delivered = state.send_to_connection(
        &to_connection_id,
        ServerMessage::IncomingCall {
            from_user_id: from_user_id.to_string(),
            from_connection_id: from_connection_id.to_string(),
            offer: offer.to_string(),
        },
    );

    if !delivered {
        // Target vanished between lookup and forward. The offer is gone;
        // the caller's own dial timeout covers recovery.
        tracing::debug!(to = to_user_id, "Call offer dropped, target vanished");
        return;
    }

    if !state.link_call(from_connection_id, &to_connection_id) {
        // One side is mid-call; its client rejects the new offer itself
        tracing::debug!(
            from = from_user_id,
            to = to_user_id,
            "Call link kept for existing call"
        );
    }

    state.send_to_connection(
        from_connection_id,
        ServerMessage::CallPlaced {
            to_user_id: to_user_id.to_string(),
            to_connection_id,
        },
    );
}

/// Forward a message verbatim; a missing target is silently absorbed.
fn forward(state: &RelayState, to_connection_id: &str, msg: ServerMessage) {
    if !state.send_to_connection(to_connection_id, msg) {
        tracing::debug!(
            to_connection = to_connection_id,
            "Forward target gone, message dropped"
        );
    }
}
