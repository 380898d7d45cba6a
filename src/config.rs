//! Configuration module for the tcp-serv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::server::{parse_listen_addr, ServerConfig};

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "tcp-serv")]
#[command(author = "tcp-serv authors")]
#[command(version = "0.1.0")]
#[command(about = "A minimal TCP server with idle timeouts and graceful drain", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9000 or :9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Idle timeout in milliseconds; resets on every read or write
    #[arg(short = 't', long)]
    pub idle_timeout_ms: Option<u64>,

    /// Maximum bytes delivered to the handler per read
    #[arg(short = 'b', long)]
    pub byte_limit: Option<usize>,

    /// Interval between progress logs while draining on shutdown
    #[arg(long)]
    pub drain_interval_ms: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Idle timeout in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Per-read byte limit
    #[serde(default = "default_byte_limit")]
    pub byte_limit: usize,
    /// Drain progress interval in milliseconds
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout_ms: default_idle_timeout_ms(),
            byte_limit: default_byte_limit(),
            drain_interval_ms: default_drain_interval_ms(),
            backlog: default_backlog(),
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
    "127.0.0.1:9000".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    5_000
}

fn default_byte_limit() -> usize {
    1024
}

fn default_drain_interval_ms() -> u64 {
    500
}

fn default_backlog() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub idle_timeout: Duration,
    pub byte_limit: usize,
    pub drain_interval: Duration,
    pub backlog: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            idle_timeout: Duration::from_millis(
                cli.idle_timeout_ms
                    .unwrap_or(toml_config.server.idle_timeout_ms),
            ),
            byte_limit: cli.byte_limit.unwrap_or(toml_config.server.byte_limit),
            drain_interval: Duration::from_millis(
                cli.drain_interval_ms
                    .unwrap_or(toml_config.server.drain_interval_ms),
            ),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.byte_limit == 0 {
            return Err(ConfigError::Invalid("byte_limit must be greater than 0".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.drain_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "drain_interval_ms must be greater than 0".into(),
            ));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0".into()));
        }
        parse_listen_addr(&self.listen).map_err(|e| {
            ConfigError::Invalid(format!("invalid listen address '{}': {}", self.listen, e))
        })?;
        Ok(())
    }

    /// Server construction parameters.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen.clone(),
            idle_timeout: self.idle_timeout,
            byte_limit: self.byte_limit,
            drain_interval: self.drain_interval,
            backlog: self.backlog,
        }
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
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
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.idle_timeout_ms, 5_000);
        assert_eq!(config.server.byte_limit, 1024);
        assert_eq!(config.server.drain_interval_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            idle_timeout_ms = 30000
            byte_limit = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.idle_timeout_ms, 30_000);
        assert_eq!(config.server.byte_limit, 4096);
        assert_eq!(config.server.drain_interval_ms, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = CliArgs::try_parse_from(["tcp-serv"]).unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.byte_limit, 1024);
        assert_eq!(config.drain_interval, Duration::from_millis(500));
        assert_eq!(config.backlog, 1024);
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("tcp-serv-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[server]\nlisten = \"127.0.0.1:7000\"\nbyte_limit = 64\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let cli = CliArgs::try_parse_from([
            "tcp-serv",
            "--config",
            path.to_str().unwrap(),
            "--byte-limit",
            "128",
            "-t",
            "250",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.byte_limit, 128);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_file() {
        let cli =
            CliArgs::try_parse_from(["tcp-serv", "--config", "/nonexistent/tcp-serv.toml"]).unwrap();
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_rejects_zero_byte_limit() {
        let cli = CliArgs::try_parse_from(["tcp-serv", "--byte-limit", "0"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        let cli = CliArgs::try_parse_from(["tcp-serv", "--listen", "not an address"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_server_config() {
        let cli = CliArgs::try_parse_from(["tcp-serv", "-l", ":9100"]).unwrap();
        let server = Config::from_cli(cli).unwrap().server_config();
        assert_eq!(server.listen, ":9100");
        assert_eq!(server.byte_limit, 1024);
    }
}
