//! Axum WebSocket endpoint attaching clients to rooms.

use crate::room::RoomManager;
use crate::ws::client::ClientFrame;
use crate::ws::protocol::CLOSE_SHUTTING_DOWN;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct WsState {
    pub rooms: Arc<RoomManager>,
}

pub fn router(rooms: Arc<RoomManager>) -> Router {
    Router::new()
        .route("/api/collaboration/room/:room_id", get(ws_handler))
        .with_state(WsState { rooms })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, room_id: String, state: WsState) {
    let Some(room) = state.rooms.get_room(&room_id) else {
        tracing::warn!(room_id = %room_id, "closing socket for unknown room");
        return;
    };

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let client_id = match room.clients().add(frame_tx) {
        Ok(client_id) => client_id,
        Err(e) => {
            tracing::warn!(room_id = %room_id, error = %e, "room rejected new client");
            return;
        }
    };
    tracing::info!(room_id = %room_id, client_id = %client_id, "client connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: pushes frames from the client's channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                ClientFrame::Binary(data) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                ClientFrame::Close(code) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: every binary frame goes on the room's message queue.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Binary(data) => room.add_message(&client_id, data),
            Message::Close(_) => break,
            _ => {}
        }
    }

    tracing::info!(room_id = %room_id, client_id = %client_id, "client disconnected");
    room.clients().remove(&client_id, CLOSE_SHUTTING_DOWN);
    let _ = writer.await;
}
