use std::net::SocketAddr;
use std::time::Duration;

use crate::logging::LogLevel;

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// sqlx connection URL for the message store.
    pub database_url: String,
    /// Secret used to verify bearer tokens.
    pub auth_secret: String,
    /// How long a typing indicator stays alive without a refresh.
    pub typing_deadline: Duration,
    /// Interval of the background sweep that evicts stale typing entries.
    pub sweep_interval: Duration,
    /// Upper bound on message body length, in characters.
    pub max_body_chars: usize,
    /// Capacity of each connection's outbound event queue.
    pub delivery_buffer: usize,
    /// Bounded retries for transient store failures on the gateway path.
    pub store_retries: u32,
    /// Minimum log level.
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8900".parse().unwrap(),
            database_url: "sqlite://parley.db?mode=rwc".to_string(),
            auth_secret: String::new(),
            typing_deadline: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            max_body_chars: 1000,
            delivery_buffer: 128,
            store_retries: 3,
            log_level: LogLevel::Info,
        }
    }
}

impl ServerConfig {
    /// Build a config from `PARLEY_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(addr) = env_parse("PARLEY_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("PARLEY_DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Ok(secret) = std::env::var("PARLEY_AUTH_SECRET") {
            cfg.auth_secret = secret;
        }
        if let Some(secs) = env_parse::<u64>("PARLEY_TYPING_DEADLINE_SECS") {
            cfg.typing_deadline = Duration::from_secs(secs);
        }
        if let Some(millis) = env_parse::<u64>("PARLEY_SWEEP_INTERVAL_MS") {
            cfg.sweep_interval = Duration::from_millis(millis);
        }
        if let Some(n) = env_parse("PARLEY_MAX_BODY_CHARS") {
            cfg.max_body_chars = n;
        }
        if let Some(n) = env_parse("PARLEY_DELIVERY_BUFFER") {
            cfg.delivery_buffer = n;
        }
        if let Some(n) = env_parse("PARLEY_STORE_RETRIES") {
            cfg.store_retries = n;
        }
        if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
            cfg.log_level = LogLevel::from_str(&level);
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
