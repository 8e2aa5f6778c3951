//! Configuration module for the ready-echo server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::Timeout;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "ready-echo")]
#[command(author = "ready-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP server that logs what clients send", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the test client
#[derive(Parser, Debug)]
#[command(name = "ready-echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Connects to a ready-echo server and sends one message", long_about = None)]
pub struct ClientArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Message to send after connecting
    #[arg(short, long, default_value = "HELLO, NETTY")]
    pub message: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl ClientArgs {
    /// Resolve the server address.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.host, self.port)
    }
}

pub const DEFAULT_PORT: u16 = 6666;

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Connections beyond this are accepted and immediately dropped
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each connection's read buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Wait timeout: 0 returns immediately, negative blocks forever
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: i64,
    /// Maximum events returned by one wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Reads per connection per wake before it is deferred to the next turn
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
            read_budget: default_read_budget(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_poll_timeout_ms() -> i64 {
    1000 // 1 second
}

fn default_events_capacity() -> usize {
    1024
}

fn default_read_budget() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub poll_timeout: Timeout,
    pub events_capacity: usize,
    pub read_budget: usize,
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
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI arguments.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            max_connections: toml_config.server.max_connections,
            buffer_size: toml_config.runtime.buffer_size,
            poll_timeout: Timeout::from_millis(toml_config.runtime.poll_timeout_ms),
            events_capacity: toml_config.runtime.events_capacity,
            read_budget: toml_config.runtime.read_budget,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Check the values that would otherwise fail deep inside the event loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("buffer_size", self.buffer_size),
            ("events_capacity", self.events_capacity),
            ("read_budget", self.read_budget),
            ("max_connections", self.max_connections),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.addr().map(|_| ())
    }

    /// The socket address the listener binds to.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.host, self.port)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let formatted = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    formatted
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(formatted))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 6666);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(
            config.poll_timeout,
            Timeout::After(Duration::from_millis(1000))
        );
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            max_connections = 8

            [runtime]
            buffer_size = 64
            poll_timeout_ms = -1
            read_budget = 2

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.backlog, 1024);

        let config = Config::merge(CliArgs::default(), toml_config);
        assert_eq!(config.addr().unwrap(), "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.poll_timeout, Timeout::Forever);
        assert_eq!(config.read_budget, 2);
        assert_eq!(config.events_capacity, 1024);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhost = \"127.0.0.1\"\nport = 7000").unwrap();
        writeln!(file, "[logging]\nlevel = \"warn\"").unwrap();

        let cli = CliArgs::try_parse_from([
            "ready-echo",
            "--config",
            file.path().to_str().unwrap(),
            "--port",
            "7100",
        ])
        .unwrap();

        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7100);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/ready-echo.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "buffer_size",
                ..
            })
        ));

        let mut config = Config::default();
        config.host = "not an address".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));

        let mut config = Config::default();
        config.host = "::1".to_string();
        assert_eq!(config.addr().unwrap(), "[::1]:6666".parse().unwrap());
    }

    #[test]
    fn test_client_args() {
        let args = ClientArgs::try_parse_from(["ready-echo-client"]).unwrap();
        assert_eq!(args.message, "HELLO, NETTY");
        assert_eq!(args.addr().unwrap(), "127.0.0.1:6666".parse().unwrap());
    }
}
