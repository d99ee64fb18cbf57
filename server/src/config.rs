use std::time::Duration;

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    InvalidVar {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Origins allowed to open a WebSocket. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// `sqlite://...` or `memory`
    pub database_url: String,
    pub max_connections: usize,
    pub max_message_bytes: usize,
    /// Malformed frames tolerated per connection before it is dropped
    pub max_parse_errors: u32,
    pub store_timeout_ms: u64,
    /// Messages buffered per client before it is dropped as lagging
    pub outbound_queue: usize,
    pub ping_interval_ms: u64,
    /// A connection that sends nothing (not even a pong) for this long is dead
    pub idle_timeout_ms: u64,
    /// Delete objects left over from a previous run before accepting clients
    pub purge_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3333".to_string(),
            allowed_origins: vec!["http://localhost:5000".to_string()],
            database_url: "sqlite://world.db".to_string(),
            max_connections: 512,
            max_message_bytes: 16 * 1024,
            max_parse_errors: 20,
            store_timeout_ms: 5000,
            outbound_queue: 8192,
            ping_interval_ms: 25_000,
            idle_timeout_ms: 45_000,
            purge_on_start: true,
        }
    }
}

impl ServerConfig {
    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let host = lookup("HOST");
        let port = lookup("PORT");
        if host.is_some() || port.is_some() {
            let port: u16 = match port {
                Some(p) => parse_var("PORT", &p, "a port number")?,
                None => 3333,
            };
            let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
            config.listen_addr = format!("{}:{}", host, port);
        }

        if let Some(origins) = lookup("CORS_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(v) = lookup("MAX_CONNECTIONS") {
            config.max_connections = parse_var("MAX_CONNECTIONS", &v, "a positive integer")?;
        }
        if let Some(v) = lookup("MAX_MESSAGE_BYTES") {
            config.max_message_bytes = parse_var("MAX_MESSAGE_BYTES", &v, "a positive integer")?;
        }
        if let Some(v) = lookup("MAX_PARSE_ERRORS") {
            config.max_parse_errors = parse_var("MAX_PARSE_ERRORS", &v, "an integer")?;
        }
        if let Some(v) = lookup("STORE_TIMEOUT_MS") {
            config.store_timeout_ms = parse_var("STORE_TIMEOUT_MS", &v, "milliseconds")?;
        }
        if let Some(v) = lookup("OUTBOUND_QUEUE") {
            config.outbound_queue = parse_var("OUTBOUND_QUEUE", &v, "a positive integer")?;
        }
        if let Some(v) = lookup("PING_INTERVAL_MS") {
            config.ping_interval_ms = parse_var("PING_INTERVAL_MS", &v, "milliseconds")?;
        }
        if let Some(v) = lookup("IDLE_TIMEOUT_MS") {
            config.idle_timeout_ms = parse_var("IDLE_TIMEOUT_MS", &v, "milliseconds")?;
        }
        if let Some(v) = lookup("PURGE_ON_START") {
            config.purge_on_start = parse_bool("PURGE_ON_START", &v)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0".to_string()));
        }
        if self.max_message_bytes < 64 {
            return Err(ConfigError::Invalid(
                "max_message_bytes must be at least 64".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid("store_timeout_ms must be > 0".to_string()));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("outbound_queue must be > 0".to_string()));
        }
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("ping_interval_ms must be > 0".to_string()));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be greater than ping_interval_ms".to_string(),
            ));
        }
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed_origins must list at least one origin (or *)".to_string(),
            ));
        }
        if self.database_url != "memory" && !self.database_url.starts_with("sqlite:") {
            return Err(ConfigError::Invalid(format!(
                "unsupported database_url {:?} (expected sqlite:... or memory)",
                self.database_url
            )));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    /// CORS policy for plain HTTP requests. WebSocket upgrades are checked
    /// separately in the upgrade handler.
    pub fn cors_layer(&self) -> CorsLayer {
        if self.allows_any_origin() {
            return CorsLayer::permissive();
        }
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var,
        value: value.to_string(),
        expected,
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            var,
            value: value.to_string(),
            expected: "a boolean",
        }),
    }
}
