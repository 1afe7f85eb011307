//! WebSocket handler for client connections.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use troupe_protocol::client::{ClientCommand, ClientEvent};

use crate::orchestrator::{OrchestratorEvent, OrchestratorHandle};

use super::hub::WsHub;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<WsHub>,
    pub orchestrator: OrchestratorHandle,
}

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut event_rx) = state.hub.register();
    info!("client connection {} opened", conn);

    // Send connected message
    if let Ok(json) = serde_json::to_string(&ClientEvent::Connected)
        && sender.send(Message::Text(json.into())).await.is_err()
    {
        state.hub.unregister(conn);
        return;
    }

    // Spawn task to push orchestrator events and keepalive pings
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    let Ok(json) = serde_json::to_string(&ClientEvent::Ping) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Process incoming commands
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        if state
                            .orchestrator
                            .send(OrchestratorEvent::Command { conn, command })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("connection {} sent unparsable command: {}", conn, e);
                        let _ = state
                            .hub
                            .send(conn, ClientEvent::Error {
                                session_id: None,
                                message: format!("invalid command: {}", e),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("connection {} sent binary frame, ignoring", conn);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("connection {} closed by client", conn);
                break;
            }
            Err(e) => {
                warn!("connection {} errored: {}", conn, e);
                break;
            }
        }
    }

    // Clean up. Closing a connection never kills subprocesses; the
    // orchestrator only clears the binding so attach can pick them back up.
    send_task.abort();
    let _ = state
        .orchestrator
        .send(OrchestratorEvent::ConnectionClosed { conn })
        .await;
    state.hub.unregister(conn);
    info!("client connection {} closed", conn);
}
