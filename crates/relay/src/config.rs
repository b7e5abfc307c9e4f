// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

/// Default debounce window between the last edit and the durable flush.
pub const DEFAULT_FLUSH_QUIET_MS: u64 = 250;
const MIN_FLUSH_QUIET_MS: u64 = 10;
const MAX_FLUSH_QUIET_MS: u64 = 60_000;

const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where the durable store lives and how the connection pool is sized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Refuse connection strings that do not require TLS.
    pub require_tls: bool,
}

impl DatabaseConfig {
    /// Default pool sizing for `url`, TLS required.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
            require_tls: true,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL settings. `None` runs against the in-memory store.
    pub database: Option<DatabaseConfig>,
    /// Log filter directive (e.g. `info`, `gridsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Quiet period a document must see before its grid is flushed.
    pub flush_quiet_period: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GRIDSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `GRIDSYNC_RELAY_PORT` | `1234` |
    /// | `GRIDSYNC_RELAY_DATABASE_URL` | *(none, in-memory store)* |
    /// | `GRIDSYNC_RELAY_DB_MIN_CONNECTIONS` | `2`, capped at the maximum |
    /// | `GRIDSYNC_RELAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `GRIDSYNC_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `GRIDSYNC_RELAY_DB_REQUIRE_TLS` | `true` |
    /// | `GRIDSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `GRIDSYNC_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `GRIDSYNC_RELAY_FLUSH_QUIET_MS` | `250`, clamped to 10..=60000 |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("GRIDSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("GRIDSYNC_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(1234);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database = env("GRIDSYNC_RELAY_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                let defaults = DatabaseConfig::new(url);
                let max_connections = env("GRIDSYNC_RELAY_DB_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|max| *max > 0)
                    .unwrap_or(defaults.max_connections);
                let min_connections = env("GRIDSYNC_RELAY_DB_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(defaults.min_connections)
                    .min(max_connections);
                let acquire_timeout = env("GRIDSYNC_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.acquire_timeout);
                let require_tls = env("GRIDSYNC_RELAY_DB_REQUIRE_TLS")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok())
                    .unwrap_or(defaults.require_tls);

                DatabaseConfig {
                    min_connections,
                    max_connections,
                    acquire_timeout,
                    require_tls,
                    ..defaults
                }
            });

        let log_filter = env("GRIDSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("GRIDSYNC_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let flush_quiet_ms = env("GRIDSYNC_RELAY_FLUSH_QUIET_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_FLUSH_QUIET_MS)
            .clamp(MIN_FLUSH_QUIET_MS, MAX_FLUSH_QUIET_MS);

        Self {
            listen_addr,
            database,
            log_filter,
            log_format,
            flush_quiet_period: Duration::from_millis(flush_quiet_ms),
        }
    }
}
