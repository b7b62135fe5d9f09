//! Persistent-connection endpoint.
//!
//! Authentication happens once, at upgrade time: an invalid or absent
//! credential rejects the HTTP upgrade itself with 401 rather than
//! accepting the socket and dropping events. After the upgrade the socket
//! is split; a writer task drains the connection's outbound queue while
//! the read loop feeds client events to the gateway.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::bearer_token;
use crate::errors::{ChatError, ChatResult};
use crate::identity::Participant;
use crate::server::AppState;
use crate::{plog_debug, plog_info};

use super::protocol::{ClientEvent, ServerEvent};

#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuthQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ChatResult<Response> {
    let token = auth
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ChatError::Unauthorized("missing credential".into()))?;
    let participant = state
        .verifier
        .verify(&token)
        .ok_or_else(|| ChatError::Unauthorized("invalid credential".into()))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, participant, socket)))
}

async fn handle_socket(state: AppState, participant: Participant, socket: WebSocket) {
    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerEvent>(state.config.delivery_buffer);
    let conn_id = state
        .gateway
        .sessions()
        .register(&participant.id, participant.role, outbound_tx);
    plog_info!(
        "connection {conn_id} registered for {} ({:?})",
        participant.id,
        participant.role
    );

    let (mut write, mut read) = socket.split();

    // Writer: drain the outbound queue into text frames until either side
    // goes away.
    let writer = tokio::spawn(async move {
        let mut events = ReceiverStream::new(outbound_rx);
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: one event at a time, in arrival order. A malformed frame is a
    // negative ack, not a disconnect.
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    state
                        .gateway
                        .handle_event(conn_id, &participant, event)
                        .await;
                }
                Err(err) => {
                    plog_debug!("connection {conn_id}: malformed event: {err}");
                    state.gateway.sessions().deliver_to_connection(
                        conn_id,
                        ServerEvent::Error {
                            code: "ValidationError".to_string(),
                            message: format!("malformed event: {err}"),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong liveness is the transport's business.
            Ok(_) => {}
        }
    }

    state.gateway.handle_disconnect(conn_id);
    writer.abort();
}
