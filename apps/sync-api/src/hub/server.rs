//! WebSocket upgrade endpoint and per-connection I/O pumps.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use notably_common::{ClientEvent, UserId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::ApiError;
use crate::AppState;

use super::registry::{ConnId, OUTBOUND_QUEUE_CAPACITY};

/// Server-initiated keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Inbound frames (pongs included) must arrive within this deadline.
const READ_DEADLINE: Duration = Duration::from_secs(60);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Deserialize)]
struct WsQuery {
    user_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    // The identity is validated upstream; the hub only requires its presence.
    let raw = query
        .user_id
        .ok_or_else(|| ApiError::bad_request("user_id is required"))?;
    let user_id: UserId = raw
        .parse()
        .map_err(|_| ApiError::bad_request("invalid user_id"))?;

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, user_id)))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (ws_tx, ws_rx) = socket.split();

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let conn_id = state.registry.register(user_id, tx);
    tracing::info!(%user_id, conn_id, "connection established");

    let write_task = tokio::spawn(write_pump(ws_tx, rx));

    read_pump(ws_rx, &state, user_id, conn_id).await;

    // Teardown: removing the registry entry drops the sender, which stops the
    // write pump; the coordinator then clears room membership.
    state.registry.unregister(user_id, conn_id);
    let _ = state.hub.disconnected(user_id, conn_id).await;
    let _ = write_task.await;

    tracing::info!(%user_id, conn_id, "connection closed");
}

/// Read inbound frames under the read deadline, decode them, and forward the
/// events to the coordinator. Returns when the transport errors, the client
/// closes, or the deadline is missed.
async fn read_pump(
    mut ws_rx: SplitStream<WebSocket>,
    state: &AppState,
    user_id: UserId,
    conn_id: ConnId,
) {
    loop {
        let frame = match time::timeout(READ_DEADLINE, ws_rx.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(%user_id, conn_id, ?e, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(%user_id, conn_id, "read deadline missed");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let event: ClientEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        // Malformed messages are dropped; the connection
                        // stays open.
                        tracing::debug!(%user_id, %e, "dropping malformed message");
                        continue;
                    }
                };
                if state.hub.client_event(user_id, event).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Any frame refreshes the deadline; pings are answered by the
            // transport layer.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

/// Drain the outbound queue to the socket and emit keepalive pings. Returns
/// when the queue closes or a write fails.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
) {
    let mut ping = time::interval(PING_INTERVAL);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Queue closed: unregistered, superseded, or too slow.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
