//! Configuration module for echo-load.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-load")]
#[command(author = "echo-load authors")]
#[command(version = "0.1.0")]
#[command(about = "Line echo server and concurrent connection load tester", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to (server) or connect to (client)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (server) or connect to (client)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Number of runtime worker threads (1 = single-threaded)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModeArgs {
    /// Echo every received line back until the client sends `quit`
    Server,
    /// Open many concurrent connections and verify the echoes
    Client {
        /// Number of connections to attempt
        connections: Option<usize>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Address the server binds to and the client dials
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Maximum concurrently open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// How long shutdown waits for in-flight connections, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Client (load generator) configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Connections to attempt
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Retry budget per connection
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Nominal spacing between retries in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Upper bound of the random amount subtracted from each retry spacing
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Ramp-up rate is min(fd_limit, connections) / rate_divisor per second
    #[serde(default = "default_rate_divisor")]
    pub rate_divisor: u64,
    /// Overrides the RLIMIT_NOFILE soft limit in the rate computation
    pub fd_limit: Option<u64>,
    /// Lines each connection sends
    #[serde(default = "default_payload")]
    pub payload: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            retries: default_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            rate_divisor: default_rate_divisor(),
            fd_limit: None,
            payload: default_payload(),
        }
    }
}

/// Per-socket options
#[derive(Debug, Deserialize)]
pub struct SocketConfig {
    /// Send/receive timeout, seconds part (0 together with usecs = 0 disables)
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Send/receive timeout, microseconds part
    #[serde(default)]
    pub io_timeout_usecs: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: default_io_timeout_secs(),
            io_timeout_usecs: 0,
        }
    }
}

/// Status monitor configuration
#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
        }
    }
}

/// Async runtime configuration
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Worker threads (defaults to number of CPU cores)
    pub workers: Option<usize>,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_max_connections() -> usize {
    10000
}

fn default_backlog() -> i32 {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_connections() -> usize {
    10000
}

fn default_retries() -> u32 {
    10
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_retry_jitter_ms() -> u64 {
    1000
}

fn default_rate_divisor() -> u64 {
    5
}

fn default_payload() -> Vec<String> {
    [
        "Much to his dad and mum's dismay",
        "Hōråcé ate himself one day",
        "He didn't stop to say his grace",
        "He just sat down and ate his face",
        "quit",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}

fn default_io_timeout_secs() -> u64 {
    60
}

fn default_monitor_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which side of the protocol this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client { connections: usize },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub backlog: i32,
    pub shutdown_grace: Duration,
    pub retries: u32,
    pub retry_interval: Duration,
    pub retry_jitter: Duration,
    pub rate_divisor: u64,
    pub fd_limit: Option<u64>,
    pub payload: Vec<String>,
    pub io_timeout: Option<Duration>,
    pub monitor_interval: Duration,
    pub workers: Option<usize>,
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
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args with a parsed TOML config.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mode = match cli.mode {
            ModeArgs::Server => Mode::Server,
            ModeArgs::Client { connections } => Mode::Client {
                connections: connections.unwrap_or(toml_config.client.connections),
            },
        };

        if toml_config.client.rate_divisor == 0 {
            return Err(ConfigError::Invalid("client.rate_divisor must be positive"));
        }
        if toml_config.client.payload.iter().any(|line| line.contains('\n')) {
            return Err(ConfigError::Invalid(
                "client.payload lines must not contain a newline",
            ));
        }
        if toml_config.socket.io_timeout_usecs >= 1_000_000 {
            return Err(ConfigError::Invalid(
                "socket.io_timeout_usecs must be below 1000000",
            ));
        }

        let io_timeout = Duration::from_secs(toml_config.socket.io_timeout_secs)
            + Duration::from_micros(toml_config.socket.io_timeout_usecs.into());

        Ok(Config {
            mode,
            host: cli.host.unwrap_or(toml_config.target.host),
            port: cli.port.unwrap_or(toml_config.target.port),
            max_connections: toml_config.server.max_connections,
            backlog: toml_config.server.backlog,
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            retries: toml_config.client.retries,
            retry_interval: Duration::from_millis(toml_config.client.retry_interval_ms),
            retry_jitter: Duration::from_millis(toml_config.client.retry_jitter_ms),
            rate_divisor: toml_config.client.rate_divisor,
            fd_limit: toml_config.client.fd_limit,
            payload: toml_config.client.payload,
            io_timeout: (!io_timeout.is_zero()).then_some(io_timeout),
            monitor_interval: Duration::from_millis(toml_config.monitor.interval_ms),
            workers: cli.workers.or(toml_config.runtime.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// `host:port` the server binds to and the client dials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
