use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::SignalError;
use crate::events::ConnectionRegistry;
use crate::presence::PresenceService;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::SignalingRelay;

/// State shared by all signaling WebSocket connections.
#[derive(Clone)]
pub struct WsState {
    pub registry: ConnectionRegistry,
    pub relay: Arc<SignalingRelay>,
    pub presence: Arc<PresenceService>,
}

/// WebSocket upgrade handler. The user id in the path is supplied by the
/// authenticating boundary layer in front of this server.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: String, state: WsState) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Channel between the fanout/relay side and this socket's writer task.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    state.registry.register(&user_id, connection_id, tx.clone());
    if let Err(err) = state.presence.connection_opened(&user_id).await {
        error!(user_id = %user_id, error = %err, "presence update failed on connect");
    }
    debug!(user_id = %user_id, connection_id = %connection_id, "websocket connected");

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                debug!(user_id = %user_id, error = %err, "websocket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    if let Err(err) = state.relay.handle(&user_id, client_msg).await {
                        report_signal_error(&tx, &user_id, err);
                    }
                }
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "unparseable signaling message");
                    let _ = tx.send(ServerMessage::SignalingError {
                        message: format!("invalid message format: {}", err),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/Pong are handled by axum, binary frames are not part of
            // the signaling protocol
            _ => {}
        }
    }

    state.registry.deregister(&user_id, &connection_id);
    if let Err(err) = state.presence.connection_closed(&user_id).await {
        error!(user_id = %user_id, error = %err, "presence update failed on disconnect");
    }
    debug!(user_id = %user_id, connection_id = %connection_id, "websocket disconnected");
}

/// All relay failures surface to the sender only; the partner never hears
/// about rejected messages.
fn report_signal_error(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    user_id: &str,
    err: SignalError,
) {
    match &err {
        SignalError::Store(inner) => {
            error!(user_id = %user_id, error = %inner, "signaling store failure")
        }
        SignalError::Unauthorized => {} // already logged by the relay
        other => debug!(user_id = %user_id, error = %other, "signaling message rejected"),
    }
    let _ = tx.send(ServerMessage::SignalingError {
        message: err.to_string(),
    });
}
