//! WebSocket alert broadcaster
//!
//! Fans the pub/sub channel out to connected dashboard clients. Every
//! client gets a bounded send queue; a client that cannot keep up is
//! dropped rather than allowed to backpressure the broadcaster.
//! Reconnecting clients receive only future alerts.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;

/// Maximum queued frames per client before eviction
pub const MAX_CLIENT_QUEUE: usize = 64;
/// Write deadline per frame; slow clients are disconnected
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws/alerts`
pub async fn alerts_handler(
    ws: WebSocketUpgrade,
    State(pipeline): State<Arc<Pipeline>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match pipeline.bus().subscribe().await {
            Ok(rx) => handle_client(socket, rx).await,
            Err(e) => warn!("alert subscription failed, closing client: {:#}", e),
        }
    })
}

async fn handle_client(socket: WebSocket, mut alerts: broadcast::Receiver<String>) {
    info!("websocket client connected");
    let (mut sink, mut stream) = socket.split();

    // Dedicated writer with its own bounded queue; the broadcaster never
    // waits on a client's socket.
    let (queue_tx, mut queue_rx) = mpsc::channel::<Message>(MAX_CLIENT_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!("websocket write timed out, dropping client");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Ok(payload) => {
                    if queue_tx.try_send(Message::Text(payload)).is_err() {
                        debug!("client queue full, evicting");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("client lagged, {} alerts skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // Only "ping" is recognised; everything else is ignored
                    if text == "ping" && queue_tx.try_send(Message::Text("pong".to_string())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    writer.abort();
    info!("websocket client disconnected");
}
