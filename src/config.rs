//! Configuration module for the echo-relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "echo-relay")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP echo/broadcast server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (required unless supplied by a config file)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Echo received data back to the sender
    #[arg(short = 'e', long)]
    pub echo: bool,

    /// Broadcast received data to all other connected clients
    #[arg(short = 'b', long)]
    pub broadcast: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to "info"
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: Option<u16>,
}

/// Relay behavior configuration
#[derive(Debug, Deserialize, Default)]
pub struct RelayConfig {
    /// Echo received data back to the sender
    #[serde(default)]
    pub echo: bool,
    /// Broadcast received data to all other connected clients
    #[serde(default)]
    pub broadcast: bool,
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration, immutable after startup
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub echo: bool,
    pub broadcast: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    /// Merge parsed CLI arguments with the TOML file they point at.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = match cli.port.or(toml_config.server.port) {
            Some(0) | None => return Err(ConfigError::MissingPort),
            Some(port) => port,
        };

        Ok(Config {
            port,
            echo: cli.echo || toml_config.relay.echo,
            broadcast: cli.broadcast || toml_config.relay.broadcast,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
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
            ConfigError::MissingPort => {
                write!(
                    f,
                    "A nonzero listen port is required (positional argument or [server] port)"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
