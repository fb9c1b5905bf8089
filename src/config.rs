//! Configuration module for the tollgate server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::DrainPolicy;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the transaction server
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(author = "tollgate authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented transaction server with graceful shutdown", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Extra time given to in-flight requests once shutdown begins, in milliseconds
    #[arg(short = 'g', long)]
    pub grace_period_ms: Option<u64>,

    /// Upper bound on the whole shutdown sequence, in milliseconds
    #[arg(long)]
    pub shutdown_timeout_ms: Option<u64>,

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
    pub drain: DrainConfig,
    #[serde(default)]
    pub transaction: TransactionFileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Grace period for in-flight requests during shutdown
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Outer bound on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            grace_period_ms: default_grace_period_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Drain loop tuning
#[derive(Debug, Deserialize)]
pub struct DrainConfig {
    /// First poll interval
    #[serde(default = "default_poll_interval_base_ms")]
    pub poll_interval_base_ms: u64,
    /// Poll interval ceiling
    #[serde(default = "default_poll_interval_max_ms")]
    pub poll_interval_max_ms: u64,
    /// Seconds after which a connection still in `New` counts as idle
    #[serde(default = "default_stale_new_secs")]
    pub stale_new_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_base_ms: default_poll_interval_base_ms(),
            poll_interval_max_ms: default_poll_interval_max_ms(),
            stale_new_secs: default_stale_new_secs(),
        }
    }
}

/// Simulated processing latency
#[derive(Debug, Deserialize)]
pub struct TransactionFileConfig {
    /// Amounts above this incur a delay
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold: u64,
    /// Delay cap
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for TransactionFileConfig {
    fn default() -> Self {
        Self {
            delay_threshold: default_delay_threshold(),
            max_delay_ms: default_max_delay_ms(),
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
    "127.0.0.1:8080".to_string()
}

fn default_grace_period_ms() -> u64 {
    3_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_base_ms() -> u64 {
    1
}

fn default_poll_interval_max_ms() -> u64 {
    500
}

fn default_stale_new_secs() -> u64 {
    5
}

fn default_delay_threshold() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved transaction simulator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    pub delay_threshold: u64,
    pub max_delay: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionFileConfig::default().into()
    }
}

impl From<TransactionFileConfig> for TransactionConfig {
    fn from(file: TransactionFileConfig) -> Self {
        Self {
            delay_threshold: file.delay_threshold,
            max_delay: Duration::from_millis(file.max_delay_ms),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub grace_period: Duration,
    pub shutdown_timeout: Duration,
    pub drain: DrainPolicy,
    pub transaction: TransactionConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let drain = &toml_config.drain;
        if drain.poll_interval_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "drain.poll_interval_base_ms must be at least 1".to_string(),
            ));
        }
        if drain.poll_interval_max_ms < drain.poll_interval_base_ms {
            return Err(ConfigError::Invalid(
                "drain.poll_interval_max_ms must not be below poll_interval_base_ms".to_string(),
            ));
        }

        let drain = DrainPolicy {
            poll_interval_base: Duration::from_millis(drain.poll_interval_base_ms),
            poll_interval_max: Duration::from_millis(drain.poll_interval_max_ms),
            stale_new_after: Duration::from_secs(drain.stale_new_secs),
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            grace_period: Duration::from_millis(
                cli.grace_period_ms
                    .unwrap_or(toml_config.server.grace_period_ms),
            ),
            shutdown_timeout: Duration::from_millis(
                cli.shutdown_timeout_ms
                    .unwrap_or(toml_config.server.shutdown_timeout_ms),
            ),
            drain,
            transaction: toml_config.transaction.into(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
