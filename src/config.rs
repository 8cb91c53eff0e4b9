use std::time::Duration;

use anyhow::anyhow;

/// Runtime knobs, read once at startup from the environment (`.env`
/// supported).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// When set, presence and sessions go through redis so multiple workers
    /// can share them. Otherwise a single-process in-memory store is used.
    pub redis_url: Option<String>,
    /// Include geo fields in the user roster.
    pub show_geo: bool,
    /// Honor client nonces as connection restorations. The reference
    /// implementation computes the restoration flag and then unconditionally
    /// disables it, so this defaults to off.
    pub restore_connections: bool,
    /// Teardown retry ceiling while the shared store reports an operation in
    /// flight.
    pub close_retries: u32,
    pub close_retry_delay: Duration,
}

fn flag(name: &str) -> bool {
    matches!(dotenv::var(name).as_deref(), Ok("1") | Ok("true"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Ok(Self {
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            database_url: dotenv::var("DATABASE_URL")
                .map_err(|_| anyhow!("DATABASE_URL is not set"))?,
            redis_url: dotenv::var("REDIS_URL").ok(),
            show_geo: flag("SHOW_GEO"),
            restore_connections: flag("RESTORE_CONNECTIONS"),
            close_retries: dotenv::var("CLOSE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            close_retry_delay: Duration::from_millis(
                dotenv::var("CLOSE_RETRY_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_owned(),
            database_url: "sqlite::memory:".to_owned(),
            redis_url: None,
            show_geo: false,
            restore_connections: false,
            close_retries: 10,
            close_retry_delay: Duration::from_millis(1),
        }
    }
}
