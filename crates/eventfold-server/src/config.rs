//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "eventfold_store=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Upper bound on each store operation, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "eventfold.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is outside its allowed range.
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

/// Where the loaded configuration came from, reported once logging is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from the given file.
    File,
    /// The file was absent (or no path was given); built-in defaults apply.
    Defaults,
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `EVENTFOLD_HOST` overrides `server.host`
/// - `EVENTFOLD_PORT` overrides `server.port`
/// - `EVENTFOLD_DB_PATH` overrides `database.path`
/// - `EVENTFOLD_LOG_LEVEL` overrides `logging.level`
/// - `EVENTFOLD_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `EVENTFOLD_REQUEST_TIMEOUT_MS` overrides `store.request_timeout_ms`
///   (zero or unparseable values are ignored)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read, parsed or
/// validated.
pub fn load_config(path: Option<&str>) -> Result<(Config, ConfigOrigin), ConfigError> {
    let (mut config, origin) = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => (parse_config(&contents)?, ConfigOrigin::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (Config::default(), ConfigOrigin::Defaults)
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => (Config::default(), ConfigOrigin::Defaults),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok((config, origin))
}

/// Parses a TOML document into a [`Config`]; missing sections take defaults.
///
/// # Errors
///
/// Returns `ConfigError::Parse` on malformed TOML or mistyped values and
/// `ConfigError::Invalid` when `store.request_timeout_ms` is zero.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    if config.store.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "store.request_timeout_ms must be greater than zero",
        ));
    }
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("EVENTFOLD_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("EVENTFOLD_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("EVENTFOLD_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("EVENTFOLD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("EVENTFOLD_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(timeout) = var("EVENTFOLD_REQUEST_TIMEOUT_MS") {
        if let Ok(parsed @ 1..) = timeout.parse::<u64>() {
            config.store.request_timeout_ms = parsed;
        }
    }
}
