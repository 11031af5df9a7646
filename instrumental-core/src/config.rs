//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/instrumental/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/instrumental/` (~/.config/instrumental/)
//! - State/Logs: `$XDG_STATE_HOME/instrumental/` (~/.local/state/instrumental/)
//!
//! Library users normally build a [`CollectorConfig`] directly; the file-based
//! [`Config`] exists for the CLI and other host processes that want the
//! standard lookup behavior.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use sysinfo::System;

/// Default collector endpoint
pub const DEFAULT_HOST: &str = "collector.instrumentalapp.com";
/// Default collector port
pub const DEFAULT_PORT: u16 = 8000;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Collector session configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector session configuration
///
/// One session reports to one endpoint with one API key. The endpoint fields
/// default to the public Instrumental collector and exist mainly so tests can
/// point a session at a local mock server.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Instrumental API key assigned to your project
    pub api_key: Option<String>,

    /// Optional prefix shared by all metrics reported by this session
    /// (joined to metric names with a `.`)
    pub prefix: Option<String>,

    /// Collector hostname
    #[serde(default = "default_host")]
    pub host: String,

    /// Collector port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for a handshake acknowledgment before the transport
    /// gives up on the connection
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            prefix: None,
            host: default_host(),
            port: default_port(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl CollectorConfig {
    /// Create a configuration for the public collector with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// Set the metric-name prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Point the session at a different endpoint (testing, proxies)
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Check if the session has everything it needs to authenticate
    pub fn is_ready(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::Config(
                "collector.api_key is required".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(Error::Config("collector.host must not be empty".to_string()));
        }
        if self.response_timeout_secs == 0 {
            return Err(Error::Config(
                "collector.response_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_response_timeout() -> u64 {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
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

/// Identity strings announced in the `hello` line.
///
/// Detection goes through `sysinfo`; every field can be overridden, which is
/// how tests pin the hello line to a known value.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Client product name (defaults to this crate's name)
    pub client_name: String,
    /// Client version (defaults to this crate's version)
    pub client_version: String,
    /// OS name, space-free (the wire format is space-delimited)
    pub platform: String,
    /// OS version, space-free
    pub platform_version: String,
    /// Host identifier
    pub hostname: String,
}

impl ClientIdentity {
    /// Detect identity from the running host
    pub fn detect() -> Self {
        let platform = System::name()
            .unwrap_or_else(|| std::env::consts::OS.to_string())
            .replace(' ', "-");
        let platform_version = System::os_version()
            .unwrap_or_else(|| "unknown".to_string())
            .replace(' ', "-");
        let hostname = System::host_name()
            .unwrap_or_else(|| "unknown".to_string())
            .replace(' ', "-");

        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform,
            platform_version,
            hostname,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/instrumental/config.toml` (~/.config/instrumental/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("instrumental").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/instrumental/` (~/.local/state/instrumental/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("instrumental")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/instrumental/instrumental.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("instrumental.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
