//! Configuration module for the baseio server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::{Limits, DEFAULT_MAX_FRAME_SIZE};
use crate::protocols::ProtocolType;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// I/O backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness loop per worker (epoll/kqueue)
    #[default]
    Mio,
    /// Current-thread tokio runtime per worker
    Tokio,
}

/// Command-line arguments for the baseio server
#[derive(Parser, Debug, Default)]
#[command(name = "baseio")]
#[command(version)]
#[command(about = "Codec-driven network I/O server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8300)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (0 = one per CPU core)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// I/O backend
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Wire protocol
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Largest frame payload accepted, in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    /// Number of worker threads, 0 for one per core
    pub workers: usize,
    pub runtime: RuntimeType,
    /// Connections per worker
    pub max_connections: usize,
    /// Readiness events handled per poll
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8300".to_string(),
            workers: 0,
            runtime: RuntimeType::default(),
            max_connections: 1024,
            batch_size: 256,
        }
    }
}

/// Codec configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub protocol: ProtocolType,
    /// Largest frame payload in bytes
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolType::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Per-worker pool configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle exchanges kept per kind per worker
    pub exchange_stack_size: usize,
    /// Outbound buffers a worker may have in flight
    pub buffer_count: usize,
    /// Initial capacity of each outbound buffer
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            exchange_stack_size: 64,
            buffer_count: 4096,
            buffer_size: 16 * 1024,
        }
    }
}

/// Client configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default blocking request timeout
    pub request_timeout_ms: u64,
    /// Idle interval before a heartbeat ping, 0 to disable
    pub heartbeat_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            heartbeat_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub batch_size: usize,
    pub protocol: ProtocolType,
    pub max_frame_size: usize,
    pub exchange_stack_size: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub request_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            max_connections: toml_config.server.max_connections,
            batch_size: toml_config.server.batch_size,
            protocol: cli.protocol.unwrap_or(toml_config.codec.protocol),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.codec.max_frame_size),
            exchange_stack_size: toml_config.pool.exchange_stack_size,
            buffer_count: toml_config.pool.buffer_count,
            buffer_size: toml_config.pool.buffer_size,
            request_timeout_ms: toml_config.client.request_timeout_ms,
            heartbeat_ms: toml_config.client.heartbeat_ms,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.max_connections", self.max_connections),
            ("server.batch_size", self.batch_size),
            ("codec.max_frame_size", self.max_frame_size),
            ("pool.buffer_count", self.buffer_count),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Idle interval before a heartbeat ping, if enabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:8300");
        assert_eq!(config.runtime, RuntimeType::Mio);
        assert_eq!(config.protocol, ProtocolType::WebSocket);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.request_timeout(), Duration::from_millis(3000));
        assert_eq!(config.heartbeat(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4
            runtime = "tokio"

            [codec]
            protocol = "protobase"
            max_frame_size = 65536

            [pool]
            exchange_stack_size = 8

            [client]
            heartbeat_ms = 500

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.runtime, RuntimeType::Tokio);
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.codec.protocol, ProtocolType::Protobase);
        assert_eq!(config.pool.exchange_stack_size, 8);
        assert_eq!(config.pool.buffer_count, 4096);
        assert_eq!(config.client.heartbeat_ms, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile_path("cli_overrides");
        writeln!(
            file.1,
            "[server]\nlisten = \"0.0.0.0:1\"\nworkers = 2\n[codec]\nprotocol = \"line\""
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "baseio",
            "--config",
            file.0.to_str().unwrap(),
            "--listen",
            "127.0.0.1:2",
            "--protocol",
            "fixed-length",
        ]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:2");
        assert_eq!(config.workers, 2);
        assert_eq!(config.protocol, ProtocolType::FixedLength);
        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_config_errors() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/baseio.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));

        let cli = CliArgs {
            max_frame_size: Some(0),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::Invalid("codec.max_frame_size", _))
        ));
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "baseio-{}-{}.toml",
            name,
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
