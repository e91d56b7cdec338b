//! Configuration module - environment variable parsing

pub mod game;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::rally::{CancelMode, CancelPolicy};

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// PostgREST connection settings
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base URL of the REST endpoint, without `/rest/v1`
    pub url: String,
    /// Service key; sent as both `apikey` and bearer token
    pub service_key: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,

    /// HS256 secret for player bearer tokens
    pub jwt_secret: String,
    /// Shared credential for the tick trigger
    pub tick_token: String,

    /// Built-in cron trigger period; zero disables it
    pub tick_interval_secs: u64,
    /// Due items applied in parallel within one sweep
    pub tick_concurrency: usize,
    /// Age of a PROCESSING claim before recovery takes it over; zero disables recovery
    pub claim_timeout_secs: u64,

    pub cancel_policy: CancelPolicy,

    /// Remote store; `None` runs on the in-memory store
    pub store: Option<StoreConfig>,
    pub game_config_path: Option<PathBuf>,
    /// Initial world for the in-memory store
    pub world_seed_path: Option<PathBuf>,

    /// Player actions allowed per second per account
    pub action_rate_per_sec: u32,
    /// Cap on cached coordinate pairs; zero leaves the cache unbounded
    pub distance_cache_max: usize,
    /// Allowed client origins for CORS, comma separated
    pub client_origin: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("pretty") | Err(_) => LogFormat::Pretty,
            Ok(_) => return Err(ConfigError::Invalid("LOG_FORMAT")),
        };

        let window_fraction: f64 = parse_or("CANCEL_WINDOW_FRACTION", 0.5)?;
        if !(0.0..=1.0).contains(&window_fraction) {
            return Err(ConfigError::Invalid("CANCEL_WINDOW_FRACTION"));
        }
        let mode = match env::var("CANCEL_MODE") {
            Ok(raw) => CancelMode::from_str(&raw).map_err(|_| ConfigError::Invalid("CANCEL_MODE"))?,
            Err(_) => CancelMode::TravelBack,
        };

        let store = match env::var("STORE_URL") {
            Ok(url) => Some(StoreConfig {
                url: url.trim_end_matches('/').to_string(),
                service_key: env::var("STORE_SERVICE_KEY")
                    .map_err(|_| ConfigError::Missing("STORE_SERVICE_KEY"))?,
            }),
            Err(_) => None,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,

            jwt_secret: env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?,
            tick_token: env::var("TICK_TOKEN").map_err(|_| ConfigError::Missing("TICK_TOKEN"))?,

            tick_interval_secs: parse_or("TICK_INTERVAL_SECS", 10)?,
            tick_concurrency: parse_or("TICK_CONCURRENCY", 16)?,
            claim_timeout_secs: parse_or("CLAIM_TIMEOUT_SECS", 300)?,

            cancel_policy: CancelPolicy {
                window_fraction,
                mode,
            },

            store,
            game_config_path: env::var("GAME_CONFIG_PATH").ok().map(PathBuf::from),
            world_seed_path: env::var("WORLD_SEED_PATH").ok().map(PathBuf::from),

            action_rate_per_sec: parse_or("ACTION_RATE_PER_SEC", 5)?,
            distance_cache_max: parse_or("DISTANCE_CACHE_MAX", 0)?,
            client_origin: env::var("CLIENT_ORIGIN").ok(),
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid game data: {0}")]
    GameData(String),
}
