//! WebSocket endpoint the browser terminal connects to.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::router::{Channel, CommandRouter};
use crate::AppState;

pub async fn socket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.router))
}

async fn handle_socket(socket: WebSocket, router: Arc<CommandRouter>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let channel = Channel::new(out_tx);
    let channel_id = channel.id;

    info!("[ws:{}] Client connected", channel_id);

    // Outbound frames leave in the order they were queued.
    let output_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sender.send(Message::Text(data.into())).await.is_err() {
                break;
            }
        }
        debug!("[ws:{}] Output task finished", channel_id);
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => router.handle(&channel, text.as_str()).await,
            Ok(Message::Binary(data)) => {
                let text = String::from_utf8_lossy(&data);
                router.handle(&channel, &text).await;
            }
            Ok(Message::Close(_)) => {
                info!("[ws:{}] Client closed connection", channel_id);
                break;
            }
            Err(e) => {
                error!("[ws:{}] WebSocket error: {}", channel_id, e);
                break;
            }
            _ => {}
        }
    }

    router.disconnect(&channel);
    output_task.abort();
    info!("[ws:{}] Client disconnected", channel_id);
}
