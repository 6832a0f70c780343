//! Configuration management for the sync server

use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Hard upper bound for a single pull page, regardless of configuration
pub const PULL_LIMIT_CAP: u32 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Tunables for the sync engine
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Page size used when a pull does not ask for one
    pub default_pull_limit: u32,
    /// Largest page a client may request (never above [`PULL_LIMIT_CAP`])
    pub max_pull_limit: u32,
    /// A device counts as online if it synced within this many seconds
    pub online_window_secs: i64,
    /// Completed/resolved audit rows older than this are purged at startup
    pub queue_retention_days: Option<i64>,
}

impl SyncSettings {
    /// Clamp a requested page size into `1..=max_pull_limit`
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        let max = self.max_pull_limit.clamp(1, PULL_LIMIT_CAP);
        requested.unwrap_or(self.default_pull_limit).clamp(1, max)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            default_pull_limit: 100,
            max_pull_limit: PULL_LIMIT_CAP,
            online_window_secs: 300,
            queue_retention_days: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./compliance-sync.db".to_string(),
                max_connections: 5,
            },
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
            },
            sync: SyncSettings {
                default_pull_limit: parse_var(
                    "SYNC_DEFAULT_PULL_LIMIT",
                    defaults.sync.default_pull_limit,
                ),
                max_pull_limit: parse_var("SYNC_MAX_PULL_LIMIT", defaults.sync.max_pull_limit)
                    .min(PULL_LIMIT_CAP),
                online_window_secs: parse_var(
                    "SYNC_ONLINE_WINDOW_SECS",
                    defaults.sync.online_window_secs,
                ),
                queue_retention_days: env::var("SYNC_QUEUE_RETENTION_DAYS")
                    .ok()
                    .and_then(|raw| raw.trim().parse().ok()),
            },
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {}: {:?}, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
