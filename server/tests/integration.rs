//! Integration tests for the relay server.
//!
//! These tests start a real server instance and connect via WebSocket
//! to verify end-to-end behavior.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use world_relay::config::ServerConfig;
use world_relay::protocol::{
    ClientMsg, ObjectSpawnedMsg, PlayerUpdateMsg, ServerMsg, SpawnObjectMsg, UpdatePositionMsg,
    VoiceOfferMsg, VoiceOfferRequest, VoiceSpeakingMsg, VoiceSpeakingRequest,
};
use world_relay::relay::{run_relay, Relay, RelayCommand};
use world_relay::store::{MemoryStore, ObjectStore};
use world_relay::vec3::vec3;
use world_relay::ws::{router, AppState};

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const QUIET: Duration = Duration::from_millis(300);

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        allowed_origins: vec!["*".to_string()],
        database_url: "memory".to_string(),
        max_connections: 100,
        max_message_bytes: 1024,
        max_parse_errors: 5,
        store_timeout_ms: 1000,
        outbound_queue: 1024,
        ping_interval_ms: 5_000,
        idle_timeout_ms: 15_000,
        purge_on_start: false,
    }
}

/// Start a test server on a random available port and return the WebSocket URL.
async fn start_test_server(config: ServerConfig, store: Arc<MemoryStore>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = Relay::new(store, config.store_timeout());
    let (relay_tx, relay_rx) = mpsc::channel::<RelayCommand>(256);
    tokio::spawn(run_relay(relay_rx, relay));

    let app = router(AppState::new(relay_tx, &config), config.cors_layer());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("ws://{}/ws", addr)
}

async fn start_default_server() -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let url = start_test_server(test_config(), store.clone()).await;
    (url, store)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

/// Connect and wait for the welcome; returns the socket and the assigned id.
async fn join(url: &str) -> (Ws, String) {
    let mut ws = connect(url).await;
    match recv_msg(&mut ws).await {
        ServerMsg::Welcome(w) => (ws, w.self_id),
        other => panic!("Expected Welcome, got {:?}", other),
    }
}

/// Read the next text message and parse as ServerMsg.
async fn recv_msg(ws: &mut Ws) -> ServerMsg {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("Failed to parse server message");
            }
            Some(Ok(_)) => continue, // Skip ping/pong
            Some(Err(e)) => panic!("WebSocket error: {}", e),
            None => panic!("WebSocket closed unexpectedly"),
        }
    }
}

/// Read the next text message with a timeout.
async fn recv_msg_timeout(ws: &mut Ws, timeout: Duration) -> Option<ServerMsg> {
    tokio::time::timeout(timeout, recv_msg(ws)).await.ok()
}

/// Everything that arrives until the socket has been quiet for `QUIET`.
async fn collect_until_quiet(ws: &mut Ws) -> Vec<ServerMsg> {
    let mut msgs = Vec::new();
    while let Some(msg) = recv_msg_timeout(ws, QUIET).await {
        msgs.push(msg);
    }
    msgs
}

/// Skip messages until one satisfies `pred`.
async fn recv_matching<F>(ws: &mut Ws, pred: F) -> Option<ServerMsg>
where
    F: Fn(&ServerMsg) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = recv_msg_timeout(ws, remaining).await?;
        if pred(&msg) {
            return Some(msg);
        }
    }
}

async fn send(ws: &mut Ws, msg: &ClientMsg) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn wait_for_store<F>(store: &MemoryStore, pred: F)
where
    F: Fn(&[world_relay::objects::SpawnedObject]) -> bool,
{
    for _ in 0..100 {
        if pred(store.load_all().await.unwrap().as_slice()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Store never reached expected state");
}

async fn assert_disconnected(ws: &mut Ws, reason: &str) {
    let mut disconnected = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_millis(100), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                disconnected = true;
                break;
            }
            Err(_) => {
                // Timeout - try sending to check if connection is dead
                if ws.send(Message::Ping(vec![].into())).await.is_err() {
                    disconnected = true;
                    break;
                }
            }
            _ => continue,
        }
    }
    assert!(disconnected, "{}", reason);
}

fn spawn_tree(id: &str) -> ClientMsg {
    ClientMsg::SpawnObject(SpawnObjectMsg {
        id: id.to_string(),
        asset_id: "tree_oak.glb".to_string(),
        position: vec3(1.0, 0.0, 2.0),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_and_receive_welcome() {
    let (url, _store) = start_default_server().await;
    let (_ws, id) = join(&url).await;
    assert!(!id.is_empty());
}

#[tokio::test]
async fn test_clients_get_unique_ids() {
    let (url, _store) = start_default_server().await;
    let (_ws1, id1) = join(&url).await;
    let (_ws2, id2) = join(&url).await;
    assert_ne!(id1, id2, "Each client should get a unique ID");
}

/// Scenario A: backlog delivery of an earlier spawn, no self-announcement.
#[tokio::test]
async fn test_late_joiner_receives_object_backlog() {
    let (url, store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    send(&mut a, &spawn_tree("o1")).await;
    wait_for_store(&store, |objs| objs.iter().any(|o| o.id == "o1")).await;

    let (mut b, b_id) = join(&url).await;
    let msgs = collect_until_quiet(&mut b).await;

    let expected = ServerMsg::ObjectSpawned(ObjectSpawnedMsg {
        id: "o1".to_string(),
        asset_id: "tree_oak.glb".to_string(),
        position: vec3(1.0, 0.0, 2.0),
        player_id: a_id.clone(),
    });
    assert_eq!(msgs.iter().filter(|m| **m == expected).count(), 1);
    assert!(msgs.contains(&ServerMsg::PlayerJoined(a_id)));
    assert!(!msgs.contains(&ServerMsg::PlayerJoined(b_id)));
}

/// Scenario B: departure is announced once and the owner's objects vanish.
#[tokio::test]
async fn test_disconnect_broadcasts_once_and_cleans_up() {
    let (url, store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    let (mut b, b_id) = join(&url).await;

    send(&mut a, &spawn_tree("a1")).await;
    send(&mut a, &spawn_tree("a2")).await;
    send(&mut b, &spawn_tree("b1")).await;
    wait_for_store(&store, |objs| objs.len() == 3).await;

    a.close(None).await.unwrap();

    let msgs = collect_until_quiet(&mut b).await;
    let departures = msgs
        .iter()
        .filter(|m| **m == ServerMsg::PlayerDisconnected(a_id.clone()))
        .count();
    assert_eq!(departures, 1);

    wait_for_store(&store, |objs| objs.iter().all(|o| o.owner_id != a_id)).await;
    let remaining = store.load_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].owner_id, b_id);
}

/// Scenario C: position updates reach peers but are never echoed.
#[tokio::test]
async fn test_position_update_reaches_peer_only() {
    let (url, _store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    let (mut b, _b_id) = join(&url).await;

    send(
        &mut a,
        &ClientMsg::UpdatePosition(UpdatePositionMsg {
            position: vec3(5.0, 1.0, 0.0),
            rotation: 1.57,
        }),
    )
    .await;

    let update = recv_matching(&mut b, |m| matches!(m, ServerMsg::PlayerUpdate(_))).await;
    assert_eq!(
        update,
        Some(ServerMsg::PlayerUpdate(PlayerUpdateMsg {
            id: a_id,
            position: vec3(5.0, 1.0, 0.0),
            rotation: 1.57,
        }))
    );

    let a_msgs = collect_until_quiet(&mut a).await;
    assert!(
        !a_msgs.iter().any(|m| matches!(m, ServerMsg::PlayerUpdate(_))),
        "Sender must not receive its own update"
    );
}

/// Scenario D: a voice offer is delivered to its target only.
#[tokio::test]
async fn test_voice_offer_is_unicast() {
    let (url, _store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    let (mut b, b_id) = join(&url).await;
    let (mut c, _c_id) = join(&url).await;

    send(
        &mut a,
        &ClientMsg::VoiceOffer(VoiceOfferRequest {
            to: b_id,
            offer: serde_json::json!("X"),
        }),
    )
    .await;

    let offer = recv_matching(&mut b, |m| matches!(m, ServerMsg::VoiceOffer(_))).await;
    assert_eq!(
        offer,
        Some(ServerMsg::VoiceOffer(VoiceOfferMsg {
            from: a_id,
            offer: serde_json::json!("X"),
        }))
    );

    let c_msgs = collect_until_quiet(&mut c).await;
    assert!(!c_msgs.iter().any(|m| matches!(m, ServerMsg::VoiceOffer(_))));
    let a_msgs = collect_until_quiet(&mut a).await;
    assert!(!a_msgs.iter().any(|m| matches!(m, ServerMsg::VoiceOffer(_))));
}

#[tokio::test]
async fn test_voice_speaking_is_broadcast_with_sender_id() {
    let (url, _store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    let (mut b, _b_id) = join(&url).await;

    send(
        &mut a,
        &ClientMsg::VoiceSpeaking(VoiceSpeakingRequest { is_speaking: true }),
    )
    .await;

    let speaking = recv_matching(&mut b, |m| matches!(m, ServerMsg::VoiceSpeaking(_))).await;
    assert_eq!(
        speaking,
        Some(ServerMsg::VoiceSpeaking(VoiceSpeakingMsg {
            player_id: a_id,
            is_speaking: true,
        }))
    );
}

#[tokio::test]
async fn test_live_spawn_is_not_echoed() {
    let (url, store) = start_default_server().await;

    let (mut a, _a_id) = join(&url).await;
    let (mut b, _b_id) = join(&url).await;

    send(&mut a, &spawn_tree("o1")).await;
    wait_for_store(&store, |objs| objs.len() == 1).await;

    let spawned = recv_matching(&mut b, |m| matches!(m, ServerMsg::ObjectSpawned(_))).await;
    assert!(spawned.is_some());

    let a_msgs = collect_until_quiet(&mut a).await;
    assert!(!a_msgs.iter().any(|m| matches!(m, ServerMsg::ObjectSpawned(_))));
}

#[tokio::test]
async fn test_malformed_message_is_ignored() {
    let (url, _store) = start_default_server().await;

    let (mut a, a_id) = join(&url).await;
    let (mut b, _b_id) = join(&url).await;

    a.send(Message::Text(r#"{"event":"updatePosition","data":{"rotation":1}}"#.into()))
        .await
        .unwrap();
    send(
        &mut a,
        &ClientMsg::UpdatePosition(UpdatePositionMsg {
            position: vec3(0.0, 0.0, 1.0),
            rotation: 0.0,
        }),
    )
    .await;

    // The connection survives and the valid update still goes through
    let update = recv_matching(&mut b, |m| matches!(m, ServerMsg::PlayerUpdate(_))).await;
    match update {
        Some(ServerMsg::PlayerUpdate(u)) => assert_eq!(u.id, a_id),
        other => panic!("Expected PlayerUpdate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_message_disconnects_client() {
    let (url, _store) = start_default_server().await;
    let (mut ws, _id) = join(&url).await;

    let huge_payload = "x".repeat(2000);
    let msg = format!(
        r#"{{"event":"voice-offer","data":{{"to":"nobody","offer":"{}"}}}}"#,
        huge_payload
    );
    let _ = ws.send(Message::Text(msg.into())).await;

    assert_disconnected(&mut ws, "Client should be disconnected after oversized message").await;
}

#[tokio::test]
async fn test_parse_spam_disconnects_client() {
    let (url, _store) = start_default_server().await;
    let (mut ws, _id) = join(&url).await;

    for _ in 0..10 {
        let _ = ws.send(Message::Text("not valid json".into())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_disconnected(
        &mut ws,
        "Client should be disconnected after too many parse errors",
    )
    .await;
}

/// A client that goes silent (no frames, no pongs) is treated as gone.
#[tokio::test]
async fn test_silent_client_is_dropped_after_idle_timeout() {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        ping_interval_ms: 50,
        idle_timeout_ms: 300,
        ..test_config()
    };
    let url = start_test_server(config, store.clone()).await;

    // Never polled again, so it never answers the server's pings.
    let (mut silent, silent_id) = join(&url).await;
    send(&mut silent, &spawn_tree("s1")).await;
    wait_for_store(&store, |objs| objs.len() == 1).await;

    let (mut watcher, _watcher_id) = join(&url).await;
    let departure = recv_matching(&mut watcher, |m| {
        *m == ServerMsg::PlayerDisconnected(silent_id.clone())
    })
    .await;
    assert!(departure.is_some(), "Silent client should be disconnected");

    wait_for_store(&store, |objs| objs.is_empty()).await;
    drop(silent);
}

#[tokio::test]
async fn test_connection_limit_rejects_upgrade() {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        max_connections: 1,
        ..test_config()
    };
    let url = start_test_server(config, store).await;

    let (_first, _id) = join(&url).await;
    assert!(connect_async(url.as_str()).await.is_err(), "Second client should be refused");
}

#[tokio::test]
async fn test_disallowed_origin_is_rejected() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        allowed_origins: vec!["http://localhost:5000".to_string()],
        ..test_config()
    };
    let url = start_test_server(config, store).await;

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:5000".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}
