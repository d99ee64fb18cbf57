use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::protocol::{ClientMsg, ServerMsg};
use crate::relay::RelayCommand;

/// Shared app state passed to each WebSocket handler
#[derive(Clone)]
pub struct AppState {
    pub relay_tx: mpsc::Sender<RelayCommand>,
    pub connection_semaphore: Arc<Semaphore>,
    pub allowed_origins: Vec<String>,
    pub max_message_bytes: usize,
    pub max_parse_errors: u32,
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl AppState {
    pub fn new(relay_tx: mpsc::Sender<RelayCommand>, config: &ServerConfig) -> Self {
        Self {
            relay_tx,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            allowed_origins: config.allowed_origins.clone(),
            max_message_bytes: config.max_message_bytes,
            max_parse_errors: config.max_parse_errors,
            outbound_queue: config.outbound_queue,
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

pub fn router(app_state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(app_state)
}

/// HTTP handler for WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(app_state): State<AppState>,
) -> Response {
    if !origin_allowed(&app_state.allowed_origins, &headers) {
        tracing::warn!("Rejected WebSocket upgrade from disallowed origin {:?}", headers.get(header::ORIGIN));
        return StatusCode::FORBIDDEN.into_response();
    }

    let permit = match app_state.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!("Connection limit reached, rejecting upgrade");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let max_message_bytes = app_state.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, app_state, permit))
}

/// Requests without an Origin header (non-browser clients) are allowed.
fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    if allowed.iter().any(|o| o == "*") {
        return true;
    }
    match origin.to_str() {
        Ok(origin) => {
            let origin = origin.trim_end_matches('/');
            allowed.iter().any(|a| a.trim_end_matches('/') == origin)
        }
        Err(_) => false,
    }
}

async fn handle_socket(socket: WebSocket, app_state: AppState, _permit: OwnedSemaphorePermit) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(app_state.outbound_queue);

    // Join the relay
    let (resp_tx, resp_rx) = oneshot::channel();
    if app_state
        .relay_tx
        .send(RelayCommand::Join {
            outbound: out_tx,
            response: resp_tx,
        })
        .await
        .is_err()
    {
        tracing::error!("Failed to send Join command");
        return;
    }

    let my_id = match resp_rx.await {
        Ok(id) => id,
        Err(_) => {
            tracing::error!("Relay dropped Join without assigning an id");
            return;
        }
    };

    tracing::info!(connection_id = %my_id, "Player connected");

    let mut parse_errors: u32 = 0;
    let mut last_seen = Instant::now();
    let mut ping_timer = tokio::time::interval(app_state.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // A write that stalls this long means the peer stopped reading.
    let send_timeout = app_state.idle_timeout;

    loop {
        tokio::select! {
            // Client -> Relay
            msg = stream.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_seen = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > app_state.max_message_bytes {
                            tracing::warn!(connection_id = %my_id, "Oversized message ({} bytes), disconnecting", text.len());
                            break;
                        }
                        match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(client_msg) => {
                                let cmd = RelayCommand::Event { id: my_id.clone(), msg: client_msg };
                                if app_state.relay_tx.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                parse_errors += 1;
                                tracing::debug!(connection_id = %my_id, "Dropped malformed message: {}", e);
                                if parse_errors > app_state.max_parse_errors {
                                    tracing::warn!(connection_id = %my_id, "Too many malformed messages, disconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %my_id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }

            // Keepalive
            _ = ping_timer.tick() => {
                if last_seen.elapsed() > app_state.idle_timeout {
                    tracing::warn!(connection_id = %my_id, "No traffic for {:?}, dropping connection", last_seen.elapsed());
                    break;
                }
                match tokio::time::timeout(send_timeout, sink.send(Message::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(connection_id = %my_id, "Ping write stalled, dropping connection");
                        break;
                    }
                }
            }

            // Relay -> Client
            outbound = out_rx.recv() => {
                let Some(server_msg) = outbound else { break };
                match serde_json::to_string(&server_msg) {
                    Ok(json) => {
                        match tokio::time::timeout(send_timeout, sink.send(Message::Text(json.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                tracing::warn!(connection_id = %my_id, "Write stalled, dropping connection");
                                break;
                            }
                        }
                    }
                    Err(e) => tracing::error!(connection_id = %my_id, "Failed to encode message: {}", e),
                }
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;

    // Cleanup on disconnect
    let _ = app_state
        .relay_tx
        .send(RelayCommand::Leave { id: my_id.clone() })
        .await;
    tracing::info!(connection_id = %my_id, "Player disconnected");
}
