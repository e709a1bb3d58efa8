//! Configuration module for the frame-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "frame-echo")]
#[command(author = "frame-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-multiplexed framed byte-transform server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9990)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Per-connection outbound buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Maximum bytes taken from a socket per read
    #[arg(short = 'r', long)]
    pub read_buffer_size: Option<usize>,

    /// Maximum number of live connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum readiness events handled per poll
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness events handled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            batch_size: default_batch_size(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum bytes taken from a socket per read
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_buffer_size: default_buffer_size(),
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
    "0.0.0.0:9990".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_connections() -> usize {
    2048
}

fn default_backlog() -> i32 {
    1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub buffer_size: usize,
    pub read_buffer_size: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub batch_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["frame-echo"]), TomlConfig::default())
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.connection.read_buffer_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            batch_size: cli.batch_size.unwrap_or(toml_config.server.batch_size),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be greater than 0",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:9990");
        assert_eq!(config.server.max_connections, 2048);
        assert_eq!(config.connection.buffer_size, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:7000"
            max_connections = 16
            backlog = 64

            [connection]
            buffer_size = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.batch_size, 1024);
        assert_eq!(config.connection.buffer_size, 4096);
        assert_eq!(config.connection.read_buffer_size, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from(["frame-echo", "-b", "64", "--log-level", "trace"]);
        let file: TomlConfig = toml::from_str(
            r#"
            [connection]
            buffer_size = 4096
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.listen, "0.0.0.0:9990");
    }

    #[test]
    fn test_explicit_default_level_overrides_file() {
        let cli = CliArgs::parse_from(["frame-echo", "--log-level", "info"]);
        let file: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        assert_eq!(Config::merge(cli, file).log_level, "info");

        let cli = CliArgs::parse_from(["frame-echo"]);
        let file: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        assert_eq!(Config::merge(cli, file).log_level, "warn");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config {
            buffer_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Config::default().validate().is_ok());
    }
}
