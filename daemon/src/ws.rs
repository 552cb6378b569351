//! `/ws` session bus: one queue per connected client.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use seedalchemy_core::frames;
use std::sync::Arc;
use tracing::debug;

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (session, mut rx) = state.sessions.open().await;
    let id = session.id();
    drop(session);

    let (mut sender, mut receiver) = socket.split();

    // The id frame goes out before anything the worker queues
    if sender.send(Message::Binary(frames::session_id(id))).await.is_err() {
        state.sessions.close(id).await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    // Clients never send anything meaningful; wait for them to go away
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} socket error: {}", id, e);
                break;
            }
        }
    }

    state.sessions.close(id).await;
    send_task.abort();
}
