//! Configuration module for the gateway.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::constants::{
    DEFAULT_LISTEN, DEFAULT_REGISTRY, POOL_CAPACITY, READ_TIMEOUT, SESSION_KEY,
    SOCKET_BUFFER_SIZE, SWEEP_INTERVAL, UPLINK_QUEUE_DEPTH,
};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the gateway
#[derive(Parser, Debug)]
#[command(name = "game-gate")]
#[command(author = "game-gate authors")]
#[command(version)]
#[command(about = "A TCP gateway for game servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:6600 or :6600)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Backend registry address
    #[arg(short = 'r', long)]
    pub registry: Option<String>,

    /// Gateway id
    #[arg(short = 'g', long)]
    pub gate_id: Option<u32>,

    /// Number of pooled sessions (maximum concurrent clients)
    #[arg(short = 'n', long)]
    pub capacity: Option<usize>,

    /// Number of runtime threads (1 runs everything on one thread)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Gateway id
    #[serde(default)]
    pub gate_id: u32,
    /// Number of runtime threads
    pub workers: Option<usize>,
    /// Socket send/receive buffer size in bytes
    #[serde(default = "default_socket_buffer")]
    pub socket_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            gate_id: 0,
            workers: None,
            socket_buffer: default_socket_buffer(),
        }
    }
}

/// Session pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Number of pooled sessions
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Interval between reclamation sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Seconds allowed for reading one frame
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Packets per minute before a client is kicked (0 = unlimited)
    #[serde(default)]
    pub max_packets_per_minute: u32,
    /// Override for the shared RC4 key
    pub crypto_key: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            max_packets_per_minute: 0,
            crypto_key: None,
        }
    }
}

/// Backend configuration
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    /// Registry address
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Depth of the uplink queue
    #[serde(default = "default_uplink_depth")]
    pub uplink_depth: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            uplink_depth: default_uplink_depth(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_socket_buffer() -> usize {
    SOCKET_BUFFER_SIZE
}

fn default_capacity() -> usize {
    POOL_CAPACITY
}

fn default_sweep_interval() -> u64 {
    SWEEP_INTERVAL.as_secs()
}

fn default_read_timeout() -> u64 {
    READ_TIMEOUT.as_secs()
}

fn default_registry() -> String {
    DEFAULT_REGISTRY.to_string()
}

fn default_uplink_depth() -> usize {
    UPLINK_QUEUE_DEPTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub registry: String,
    pub gate_id: u32,
    pub capacity: usize,
    pub workers: usize,
    pub socket_buffer: usize,
    pub sweep_interval: u64,
    pub read_timeout: u64,
    pub max_packets_per_minute: u32,
    pub crypto_key: Vec<u8>,
    pub uplink_depth: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);

        let config = Config {
            listen: parse_listen(&listen)?,
            registry: cli.registry.unwrap_or(toml_config.backend.registry),
            gate_id: cli.gate_id.unwrap_or(toml_config.server.gate_id),
            capacity: cli.capacity.unwrap_or(toml_config.pool.capacity),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(1),
            socket_buffer: toml_config.server.socket_buffer,
            sweep_interval: toml_config.pool.sweep_interval,
            read_timeout: toml_config.session.read_timeout,
            max_packets_per_minute: toml_config.session.max_packets_per_minute,
            crypto_key: toml_config
                .session
                .crypto_key
                .map(String::into_bytes)
                .unwrap_or_else(|| SESSION_KEY.to_vec()),
            uplink_depth: toml_config.backend.uplink_depth,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_format: cli.log_format.unwrap_or(toml_config.logging.format),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.capacity == 0, "pool capacity must be at least 1"),
            (self.workers == 0, "workers must be at least 1"),
            (self.sweep_interval == 0, "sweep_interval must be at least 1 second"),
            (self.read_timeout == 0, "read_timeout must be at least 1 second"),
            (self.uplink_depth == 0, "uplink_depth must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid(msg.to_string())),
            None => Ok(()),
        }
    }
}

/// Parse a listen address; a bare `:port` means every interface.
fn parse_listen(listen: &str) -> Result<SocketAddr, ConfigError> {
    let full = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    full.parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", listen)))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
