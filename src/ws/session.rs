//! Manages the WebSocket connection lifecycle for one AudioHook session.

use super::dispatch;
use crate::registry::SessionPhase;
use crate::state::AppState;
use crate::transport::WsSink;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Transport header carrying the externally supplied session id.
pub const SESSION_ID_HEADER: &str = "Audiohook-Session-Id";

/// Axum handler to upgrade an HTTP connection to a WebSocket.
///
/// The upgrade is rejected with 400 before any session record is created
/// when the session-id header is absent or empty.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if session_id.is_empty() {
        warn!("Upgrade rejected: missing {SESSION_ID_HEADER} header");
        return (
            StatusCode::BAD_REQUEST,
            format!("missing {SESSION_ID_HEADER} header"),
        )
            .into_response();
    }

    info!(%session_id, "New WebSocket session");
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

/// The read loop for one accepted connection.
///
/// Frames for a single session are processed strictly in order: the next
/// frame is not read until the previous one has been fully dispatched. Every
/// exit path funnels into the idempotent teardown at the bottom.
#[instrument(name = "ws_session", skip_all, fields(session_id = %session_id))]
async fn handle_socket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let (sink, mut receiver) = socket.split();

    let Some(session) = state
        .registry
        .add(session_id.clone(), Box::new(WsSink::new(sink)))
    else {
        // Duplicate id. Dropping both halves closes the new connection; the
        // existing session is left untouched.
        return;
    };
    session.advance_phase(SessionPhase::Open);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Shutdown requested; leaving read loop");
                break;
            }
            frame = receiver.next() => {
                match frame {
                    None => {
                        info!("Connection ended by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Transport error; tearing session down");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        dispatch::handle_text_frame(&state, &session_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.audio.handle_binary(&session_id, data).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Close frame received");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                }
                // A sequence violation evicts the session mid-loop.
                if state.registry.get(&session_id).is_none() {
                    break;
                }
            }
        }
    }

    state.registry.remove(&session_id).await;
    info!("Session finished");
}
