//! Per-connection handling: identity, group membership and frame dispatch.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use lims_protocol::envelope::{
    empty_forward_message, DeviceStatusBroadcast, RelayAck, RoomMessage, DEVICE_STATUS_UPDATE, SEND_TO_CLIENT,
};
use lims_protocol::{ClientIdentity, RelayEnvelope, OBSERVER_GROUP};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::hub::ConnId;
use crate::state::RelayState;

/// Route one text frame from `sender`. Returns the acknowledgment owed to
/// the sender, if any.
pub async fn dispatch(state: &RelayState, sender: &ClientIdentity, text: &str) -> Option<RelayAck> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(client_id = %sender, error = %e, bytes = text.len(), "invalid JSON frame");
            return Some(RelayAck::invalid_json());
        }
    };
    let envelope: RelayEnvelope = match serde_json::from_value(value.clone()) {
        Ok(env) => env,
        Err(_) => {
            let command = value.get("command").map(Value::to_string).unwrap_or_else(|| "None".into());
            return Some(RelayAck::unknown_command(&command));
        }
    };

    match envelope.command.as_str() {
        DEVICE_STATUS_UPDATE => {
            let broadcast = DeviceStatusBroadcast::new(sender.as_str(), envelope.payload.unwrap_or(Value::Null));
            match serde_json::to_string(&broadcast) {
                Ok(json) => {
                    let reached = state.hub.send_group(OBSERVER_GROUP, &json).await;
                    tracing::debug!(client_id = %sender, observers = reached, "device status rebroadcast");
                }
                Err(e) => warn!(client_id = %sender, error = %e, "status broadcast not serializable"),
            }
            None
        }
        SEND_TO_CLIENT => {
            let Some(target) = envelope.target_client_id.filter(|t| !t.is_empty()) else {
                return Some(RelayAck::error("缺少 target_client_id"));
            };
            let message = envelope.message.unwrap_or_else(empty_forward_message);
            let group = ClientIdentity::from(target.as_str()).private_group();
            let recipients = state.hub.send_group(&group, &message.to_string()).await;
            info!(from = %sender, to = %target, recipients, "forwarded to client");
            Some(RelayAck::forwarded(&target, recipients))
        }
        other => Some(RelayAck::unknown_command(other)),
    }
}

fn encode(ack: &RelayAck) -> Option<String> {
    serde_json::to_string(ack)
        .map_err(|e| warn!(error = %e, "ack not serializable"))
        .ok()
}

/// Drive one relay connection until either side closes it.
pub async fn run_relay(mut socket: WebSocket, state: Arc<RelayState>, identity: ClientIdentity) {
    let conn = state.hub.next_conn();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let private = identity.private_group();

    state.hub.join(&private, conn, tx.clone()).await;
    if identity.is_observer() {
        state.hub.join(OBSERVER_GROUP, conn, tx.clone()).await;
        info!(client_id = %identity, %conn, "web client connected, joined observers");
    } else {
        info!(client_id = %identity, %conn, "device client connected");
    }
    state.connected();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = dispatch(&state, &identity, text.as_str()).await.as_ref().and_then(encode) {
                            // Replies share the outbox so they stay ordered with forwarded traffic.
                            let _ = tx.send(reply);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(client_id = %identity, error = %e, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    leave_all(&state, &identity, conn).await;
    info!(client_id = %identity, %conn, "client disconnected");
}

async fn leave_all(state: &RelayState, identity: &ClientIdentity, conn: ConnId) {
    if identity.is_observer() {
        state.hub.leave(OBSERVER_GROUP, conn).await;
    }
    state.hub.leave(&identity.private_group(), conn).await;
    state.disconnected();
}

/// Room connections: every frame goes to every member, sender included,
/// wrapped as `{"message": <text>}`.
pub async fn run_room(mut socket: WebSocket, state: Arc<RelayState>, room: String) {
    let conn = state.hub.next_conn();
    let group = format!("room_{room}");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.hub.join(&group, conn, tx).await;
    state.connected();
    info!(%room, %conn, "room member connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let wrapped = RoomMessage { message: text.as_str().to_string() };
                        match serde_json::to_string(&wrapped) {
                            Ok(json) => {
                                state.hub.send_group(&group, &json).await;
                            }
                            Err(e) => warn!(%room, error = %e, "room frame not serializable"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%room, error = %e, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.leave(&group, conn).await;
    state.disconnected();
    info!(%room, %conn, "room member disconnected");
}
