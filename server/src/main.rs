use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use world_relay::config::ServerConfig;
use world_relay::relay::{run_relay, Relay, RelayCommand};
use world_relay::store::open_store;
use world_relay::ws::{router, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid server configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        eprintln!("Invalid server configuration: {}", e);
        std::process::exit(1);
    }

    let store = match open_store(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open object store {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };

    let mut relay = Relay::new(store, config.store_timeout());
    if config.purge_on_start {
        relay.purge_stale_objects().await;
    }

    let (relay_tx, relay_rx) = mpsc::channel::<RelayCommand>(1024);
    tokio::spawn(run_relay(relay_rx, relay));

    let app = router(AppState::new(relay_tx, &config), config.cors_layer());

    tracing::info!("Starting relay server on {}", config.listen_addr);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
