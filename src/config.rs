//! Configuration module for ack-reactor.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "ack-reactor")]
#[command(author = "ack-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded reactor that acknowledges every read", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Capacity of the per-read buffer in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Acknowledgment text written back after every read
    #[arg(short = 'a', long)]
    pub ack: Option<String>,

    /// Maximum number of readiness events returned by one wait
    #[arg(short = 'e', long)]
    pub events_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reactor: ReactorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct ReactorConfig {
    /// Per-read buffer capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Events returned per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Reply written after every read
    #[serde(default = "default_ack")]
    pub ack: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
            ack: default_ack(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    128
}

fn default_events_capacity() -> usize {
    1024
}

fn default_ack() -> String {
    "已收到！".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub buffer_size: usize,
    pub events_capacity: usize,
    pub ack: Vec<u8>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
            ack: default_ack().into_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args over a parsed TOML file and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen}'")))?;

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.reactor.buffer_size);
        if buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero".into()));
        }

        let events_capacity = cli
            .events_capacity
            .unwrap_or(toml_config.reactor.events_capacity);
        if events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be non-zero".into(),
            ));
        }

        Ok(Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size,
            events_capacity,
            ack: cli.ack.unwrap_or(toml_config.reactor.ack).into_bytes(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
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
            ConfigError::Invalid(what) => write!(f, "Invalid configuration: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}
