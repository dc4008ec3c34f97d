//! Live room connections.
//!
//! Each socket is split: a writer task drains the connection's queue into
//! the sink while the reader publishes inbound text frames to the room. The
//! connection is registered for its whole lifetime and deregistered on
//! close or read error.

use std::sync::Arc;

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use pairchat_core::{Environment, RoomId};
use tokio::sync::mpsc;

use crate::{fanout::Fanout, service::Service};

/// Upgrade to a WebSocket joined to `room_id`.
#[allow(clippy::unused_async)]
pub async fn upgrade<E: Environment>(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(service): State<Arc<Service<E>>>,
) -> Response {
    let fanout = Arc::clone(service.fanout());
    let room_id = RoomId::from(room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, fanout))
}

async fn handle_socket(socket: WebSocket, room_id: RoomId, fanout: Arc<Fanout>) {
    let registry = Arc::clone(fanout.registry());
    let conn = registry.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut sink, mut stream) = socket.split();

    registry.join(conn, &room_id, tx);
    tracing::info!(room_id = %room_id, %conn, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                fanout.broadcast(&room_id, text.to_string(), Some(conn)).await;
            },
            Ok(Message::Close(_)) => break,
            // Pings are answered by the protocol layer; binary frames are ignored.
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_)) => {},
            Err(e) => {
                tracing::debug!(room_id = %room_id, %conn, "websocket read error: {e}");
                break;
            },
        }
    }

    registry.leave(conn, &room_id);
    writer.abort();
    tracing::info!(room_id = %room_id, %conn, "websocket disconnected");
}
