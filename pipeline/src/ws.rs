use crate::realtime::ChannelRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages a client may send after connecting.
///
/// The user id is taken at face value; authenticating it is the job of
/// whatever terminates the connection in front of this service.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ClientMessage {
    JoinUserRoom { user_id: Uuid },
    LeaveUserRoom { user_id: Uuid },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ChannelRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<ChannelRegistry>) {
    let conn_id = Uuid::new_v4();
    let mut rx = registry.connect(conn_id).await;
    let open = registry.connection_count().await;
    info!(conn_id = %conn_id, open, "WebSocket connected");
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::JoinUserRoom { user_id }) => {
                    registry.join(conn_id, user_id).await;
                    info!(conn_id = %conn_id, user_id = %user_id, "Joined user room");
                }
                Ok(ClientMessage::LeaveUserRoom { user_id }) => {
                    registry.leave(conn_id, user_id).await;
                    debug!(conn_id = %conn_id, user_id = %user_id, "Left user room");
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "Ignoring unrecognised client message");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    registry.disconnect(conn_id).await;
    send_task.abort();
    info!(conn_id = %conn_id, "WebSocket disconnected");
}
