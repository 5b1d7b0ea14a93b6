// =============================================================================
// WebSocket Handler — Push-based chart updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate ChartSnapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the state_version has changed
//      since the last push.
//
// Text frames sent by the client are selection requests with the same JSON
// body as `POST /api/v1/selection`. Invalid requests are answered with an
// error frame; the connection stays open.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::rest::{submit_selection, SelectionRequest};
use crate::app_state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted -- upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Push** — every 500 ms, send a new snapshot if the version changed.
///   2. **Recv** — selection requests, Ping/Pong and Close.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = send_snapshot(&mut sender, &state).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        return;
    }
    let mut last_sent_version = state.current_state_version();
    let mut push_interval = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current_version = state.current_state_version();
                if current_version != last_sent_version {
                    if let Err(e) = send_snapshot(&mut sender, &state).await {
                        debug!(error = %e, "WebSocket send failed -- disconnecting");
                        break;
                    }
                    last_sent_version = current_version;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_text(&state, &text).await {
                            if let Err(e) = sender.send(Message::Text(reply)).await {
                                debug!(error = %e, "WebSocket send failed -- disconnecting");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong -- disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received -- disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error -- disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Treat a client text frame as a selection request. Returns an error frame
/// for the client when the request is rejected.
async fn handle_text(state: &AppState, text: &str) -> Option<String> {
    let request: SelectionRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable WebSocket message");
            return Some(error_frame(&format!("invalid selection request: {e}")));
        }
    };

    match submit_selection(state, request).await {
        Ok(()) => None,
        Err((_, msg)) => Some(error_frame(&msg)),
    }
}

fn error_frame(msg: &str) -> String {
    serde_json::json!({ "error": msg }).to_string()
}

/// Serialize and send the current ChartSnapshot.
async fn send_snapshot<S>(sender: &mut S, state: &AppState) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = state.build_snapshot();

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.state_version, "WebSocket snapshot sent");
            Ok(())
        }
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}
