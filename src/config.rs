//! Configuration module for the relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::framing::Framing;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay server
#[derive(Parser, Debug, Default)]
#[command(name = "heartbeat-relay")]
#[command(author = "heartbeat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-client TCP relay with heartbeat liveness", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Accept backlog of the listening socket
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Capacity of the read queue (messages beyond it are dropped)
    #[arg(long)]
    pub read_queue_size: Option<usize>,

    /// Capacity of the write queue (the process stage waits when it is full)
    #[arg(long)]
    pub write_queue_size: Option<usize>,

    /// Liveness timeout in seconds used until a client connects
    #[arg(long)]
    pub default_heartbeat_interval: Option<f64>,

    /// Factor applied to the client-declared heartbeat interval
    #[arg(long)]
    pub heartbeat_multiplier: Option<f64>,

    /// Frame boundaries on the wire
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog; bounds pending connections, not concurrent clients
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Largest frame accepted from a client
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// How long one receive waits before reporting an empty read
    #[serde(default = "default_read_granularity_ms")]
    pub read_granularity_ms: u64,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            read_granularity_ms: default_read_granularity_ms(),
            framing: Framing::default(),
        }
    }
}

/// Pipeline queue configuration
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_size")]
    pub read_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub write_queue_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_queue_size: default_queue_size(),
            write_queue_size: default_queue_size(),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds of silence tolerated before the client's first connect frame
    #[serde(default = "default_heartbeat_interval")]
    pub default_interval: f64,
    #[serde(default = "default_heartbeat_multiplier")]
    pub multiplier: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            default_interval: default_heartbeat_interval(),
            multiplier: default_heartbeat_multiplier(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_backlog() -> i32 {
    1
}

fn default_buffer_size() -> usize {
    4096
}

fn default_read_granularity_ms() -> u64 {
    100
}

fn default_queue_size() -> usize {
    100
}

fn default_heartbeat_interval() -> f64 {
    10.0
}

fn default_heartbeat_multiplier() -> f64 {
    3.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub buffer_size: usize,
    pub read_granularity: Duration,
    pub framing: Framing,
    pub read_queue_size: usize,
    pub write_queue_size: usize,
    pub default_heartbeat_interval: Duration,
    pub heartbeat_multiplier: f64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            read_granularity: Duration::from_millis(default_read_granularity_ms()),
            framing: Framing::default(),
            read_queue_size: default_queue_size(),
            write_queue_size: default_queue_size(),
            default_heartbeat_interval: Duration::from_secs_f64(default_heartbeat_interval()),
            heartbeat_multiplier: default_heartbeat_multiplier(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
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

        Config::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let default_interval = cli
            .default_heartbeat_interval
            .unwrap_or(toml_config.heartbeat.default_interval);

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size: toml_config.server.buffer_size,
            read_granularity: Duration::from_millis(toml_config.server.read_granularity_ms),
            framing: cli.framing.unwrap_or(toml_config.server.framing),
            read_queue_size: cli
                .read_queue_size
                .unwrap_or(toml_config.pipeline.read_queue_size),
            write_queue_size: cli
                .write_queue_size
                .unwrap_or(toml_config.pipeline.write_queue_size),
            default_heartbeat_interval: seconds("default heartbeat interval", default_interval)?,
            heartbeat_multiplier: cli
                .heartbeat_multiplier
                .unwrap_or(toml_config.heartbeat.multiplier),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.read_granularity.is_zero() {
            return Err(ConfigError::Invalid(
                "read_granularity_ms must be positive".into(),
            ));
        }
        if self.read_queue_size == 0 || self.write_queue_size == 0 {
            return Err(ConfigError::Invalid("queue sizes must be positive".into()));
        }
        if !(self.heartbeat_multiplier.is_finite() && self.heartbeat_multiplier > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat multiplier must be a positive number, got {}",
                self.heartbeat_multiplier
            )));
        }
        Ok(())
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds, got {value}"
        ))
    };

    if !(value.is_finite() && value > 0.0) {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(value).map_err(|_| invalid())
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:7878");
        assert_eq!(config.backlog, 1);
        assert_eq!(config.read_queue_size, 100);
        assert_eq!(config.write_queue_size, 100);
        assert_eq!(config.default_heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_multiplier, 3.0);
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            backlog = 4
            buffer_size = 1024
            read_granularity_ms = 50
            framing = "raw"

            [pipeline]
            read_queue_size = 8
            write_queue_size = 16

            [heartbeat]
            default_interval = 2.5
            multiplier = 1.5

            [logging]
            level = "debug"
            file = "server_logs.txt"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.backlog, 4);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.read_granularity, Duration::from_millis(50));
        assert_eq!(config.framing, Framing::Raw);
        assert_eq!(config.read_queue_size, 8);
        assert_eq!(config.write_queue_size, 16);
        assert_eq!(config.default_heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_multiplier, 1.5);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file, Some(PathBuf::from("server_logs.txt")));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::try_parse_from([
            "heartbeat-relay",
            "--listen",
            "127.0.0.1:0",
            "--read-queue-size",
            "1",
            "--framing",
            "raw",
            "--log-level",
            "trace",
        ])
        .unwrap();
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            framing = "length-prefixed"

            [pipeline]
            read_queue_size = 50
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.read_queue_size, 1);
        assert_eq!(config.framing, Framing::Raw);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let toml_config: TomlConfig = toml::from_str("[pipeline]\nread_queue_size = 0").unwrap();
        assert!(matches!(
            Config::merge(CliArgs::default(), toml_config),
            Err(ConfigError::Invalid(_))
        ));

        let cli = CliArgs {
            heartbeat_multiplier: Some(-1.0),
            ..CliArgs::default()
        };
        assert!(Config::merge(cli, TomlConfig::default()).is_err());

        let cli = CliArgs {
            default_heartbeat_interval: Some(f64::NAN),
            ..CliArgs::default()
        };
        assert!(Config::merge(cli, TomlConfig::default()).is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_interval() {
        let cli = CliArgs {
            default_heartbeat_interval: Some(1e30),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
