//! Load test for the relay server.
//!
//! Spawns multiple fake WebSocket clients that:
//! - Connect to the server and wait for the welcome
//! - Periodically send updatePosition messages
//! - Count playerUpdate broadcasts from their peers
//!
//! Usage: cargo run --bin loadtest -- [OPTIONS]
//!
//! Options:
//!   --clients N      Number of clients to spawn (default: 50)
//!   --duration S     Test duration in seconds (default: 30)
//!   --update-rate R  Position updates per second per client (default: 10)
//!   --spawn-every N  Spawn one object every N updates, 0 = never (default: 0)
//!   --url URL        Server URL (default: ws://127.0.0.1:3333/ws)

use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use world_relay::protocol::{ClientMsg, ServerMsg, SpawnObjectMsg, UpdatePositionMsg};
use world_relay::vec3::vec3;

// === Metrics ===

#[derive(Default)]
struct Metrics {
    connected: AtomicU64,
    messages_received: AtomicU64,
    player_updates_received: AtomicU64,
    objects_received: AtomicU64,
    updates_sent: AtomicU64,
    spawns_sent: AtomicU64,
    errors: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

struct ClientOptions {
    url: String,
    update_rate: f64,
    spawn_every: u64,
    duration: Duration,
}

// === Client task ===

async fn run_client(client_id: u32, opts: Arc<ClientOptions>, metrics: Arc<Metrics>) {
    let connect_start = Instant::now();

    let (mut ws, _) = match connect_async(opts.url.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            if client_id < 5 {
                eprintln!("Client {} failed to connect: {}", client_id, e);
            }
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Wait for welcome message before doing anything else
    let welcome = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                    if let Ok(ServerMsg::Welcome(w)) = serde_json::from_str::<ServerMsg>(&text) {
                        return Some(w.self_id);
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;

    let self_id = match welcome {
        Ok(Some(id)) => id,
        _ => {
            if client_id < 3 {
                eprintln!("Client {} never got a welcome", client_id);
            }
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let connect_latency = connect_start.elapsed();
    metrics
        .latency_sum_ms
        .fetch_add(connect_latency.as_millis() as u64, Ordering::Relaxed);
    metrics.latency_count.fetch_add(1, Ordering::Relaxed);
    metrics.connected.fetch_add(1, Ordering::Relaxed);

    let update_interval = if opts.update_rate > 0.0 {
        Duration::from_secs_f64(1.0 / opts.update_rate)
    } else {
        Duration::from_secs(3600) // Effectively never
    };
    let mut update_timer = tokio::time::interval(update_interval);
    update_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let test_end = Instant::now() + opts.duration;
    let mut tick: u64 = 0;

    while Instant::now() < test_end {
        tokio::select! {
            _ = update_timer.tick() => {
                tick += 1;
                // Walk in a circle so every update differs
                let angle = (tick as f64 * 0.1) + client_id as f64;
                let update = ClientMsg::UpdatePosition(UpdatePositionMsg {
                    position: vec3(angle.cos() * 10.0, 0.0, angle.sin() * 10.0),
                    rotation: angle,
                });
                if send(&mut ws, &update).await {
                    metrics.updates_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }

                if opts.spawn_every > 0 && tick % opts.spawn_every == 0 {
                    let spawn = ClientMsg::SpawnObject(SpawnObjectMsg {
                        id: format!("{}-{}", self_id, tick),
                        asset_id: "crate.glb".to_string(),
                        position: vec3(angle.cos() * 10.0, 0.0, angle.sin() * 10.0),
                    });
                    if send(&mut ws, &spawn).await {
                        metrics.spawns_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                        match serde_json::from_str::<ServerMsg>(&text) {
                            Ok(ServerMsg::PlayerUpdate(_)) => {
                                metrics.player_updates_received.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(ServerMsg::ObjectSpawned(_)) => {
                                metrics.objects_received.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        if client_id < 3 {
                            eprintln!("Client {} error: {}", client_id, e);
                        }
                        metrics.errors.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let _ = ws.close(None).await;
    metrics.connected.fetch_sub(1, Ordering::Relaxed);
}

async fn send<S>(ws: &mut S, msg: &ClientMsg) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => ws.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

// === Main ===

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut num_clients: u32 = 50;
    let mut duration_secs: u64 = 30;
    let mut update_rate: f64 = 10.0;
    let mut spawn_every: u64 = 0;
    let mut url = "ws://127.0.0.1:3333/ws".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--clients" => {
                i += 1;
                num_clients = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(50);
            }
            "--duration" => {
                i += 1;
                duration_secs = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(30);
            }
            "--update-rate" => {
                i += 1;
                update_rate = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(10.0);
            }
            "--spawn-every" => {
                i += 1;
                spawn_every = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);
            }
            "--url" => {
                i += 1;
                url = args.get(i).cloned().unwrap_or(url);
            }
            _ => {}
        }
        i += 1;
    }

    println!("=== World Relay Load Test ===");
    println!("Clients: {}", num_clients);
    println!("Duration: {}s", duration_secs);
    println!("Update rate: {}/s per client", update_rate);
    println!("URL: {}", url);
    println!();

    let metrics = Arc::new(Metrics::default());
    let opts = Arc::new(ClientOptions {
        url,
        update_rate,
        spawn_every,
        duration: Duration::from_secs(duration_secs),
    });

    let mut handles = Vec::with_capacity(num_clients as usize);
    let spawn_start = Instant::now();

    for client_id in 0..num_clients {
        let opts = Arc::clone(&opts);
        let metrics = Arc::clone(&metrics);
        handles.push(tokio::spawn(run_client(client_id, opts, metrics)));

        // Stagger spawns slightly to avoid thundering herd
        if client_id % 50 == 49 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    println!("All clients spawned in {:?}", spawn_start.elapsed());
    println!();

    // Print stats periodically
    let metrics_clone = Arc::clone(&metrics);
    let stats_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        let start = Instant::now();
        loop {
            interval.tick().await;
            let elapsed = start.elapsed().as_secs();
            if elapsed >= duration_secs + 5 {
                break;
            }
            println!(
                "[{:3}s] connected={}, msgs={}, player_updates={}, updates_sent={}, errors={}",
                elapsed,
                metrics_clone.connected.load(Ordering::Relaxed),
                metrics_clone.messages_received.load(Ordering::Relaxed),
                metrics_clone.player_updates_received.load(Ordering::Relaxed),
                metrics_clone.updates_sent.load(Ordering::Relaxed),
                metrics_clone.errors.load(Ordering::Relaxed),
            );
        }
    });

    for handle in handles {
        let _ = handle.await;
    }
    stats_handle.abort();

    println!();
    println!("=== Final Results ===");
    let msgs = metrics.messages_received.load(Ordering::Relaxed);
    let player_updates = metrics.player_updates_received.load(Ordering::Relaxed);
    let updates_sent = metrics.updates_sent.load(Ordering::Relaxed);
    let latency_sum = metrics.latency_sum_ms.load(Ordering::Relaxed);
    let latency_count = metrics.latency_count.load(Ordering::Relaxed);

    println!("Total messages received: {}", msgs);
    println!("Total playerUpdate received: {}", player_updates);
    println!("Total objectSpawned received: {}", metrics.objects_received.load(Ordering::Relaxed));
    println!("Total updatePosition sent: {}", updates_sent);
    println!("Total spawnObject sent: {}", metrics.spawns_sent.load(Ordering::Relaxed));
    println!("Total errors: {}", metrics.errors.load(Ordering::Relaxed));
    if latency_count > 0 {
        println!("Average welcome latency: {}ms", latency_sum / latency_count);
    }

    // Every update fans out to all other clients
    let expected = updates_sent * num_clients.saturating_sub(1) as u64;
    if expected > 0 {
        println!(
            "Fan-out delivery rate: {:.1}%",
            player_updates as f64 / expected as f64 * 100.0
        );
    }
}
