//! Configuration management for the Tether daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("scrollback_buffer_size must be greater than 0")]
    InvalidScrollbackSize,

    #[error("outbox_capacity must be greater than 0")]
    InvalidOutboxCapacity,

    #[error("terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("bind must be a socket address such as 127.0.0.1:7681, got {0}")]
    InvalidBindAddress(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file (rotated daily) instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind: String,

    /// Outbound messages queued per connection before messages are dropped.
    pub outbox_capacity: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for every session.
    pub shell: String,

    /// Arguments passed to the shell.
    pub args: Vec<String>,

    /// Working directory for new sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Characters of output kept per session for replay.
    pub scrollback_buffer_size: usize,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7681".to_string(),
            outbox_capacity: crate::outbox::DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
            cwd: dirs::home_dir(),
            cols: 80,
            rows: 24,
            max_sessions: 5,
            scrollback_buffer_size: 50_000,
            env: BTreeMap::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the user's login shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Reads a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Outcome of one environment override.
///
/// Overrides are applied before logging is set up, so they are reported
/// rather than logged on the spot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The variable replaced a config value.
    Applied { var: &'static str, value: String },
    /// The variable was set but could not be used.
    Ignored {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl EnvOverride {
    /// Emits the outcome through `tracing`.
    pub fn log(&self) {
        match self {
            EnvOverride::Applied { var, value } => {
                tracing::info!("Overriding config from {}: {}", var, value);
            }
            EnvOverride::Ignored { var, value, reason } => {
                tracing::warn!("Ignoring {}: {}: {:?}", var, reason, value);
            }
        }
    }
}

/// Reads and parses a numeric environment variable, recording garbage.
fn env_number<T: FromStr>(name: &'static str, report: &mut Vec<EnvOverride>) -> Option<T> {
    let raw = env_value(name)?;
    match raw.trim().parse() {
        Ok(value) => {
            report.push(EnvOverride::Applied {
                var: name,
                value: raw,
            });
            Some(value)
        }
        Err(_) => {
            report.push(EnvOverride::Ignored {
                var: name,
                value: raw,
                reason: "not a number",
            });
            None
        }
    }
}

/// Reads a string environment variable, recording it as applied.
fn env_string(name: &'static str, report: &mut Vec<EnvOverride>) -> Option<String> {
    let value = env_value(name)?;
    report.push(EnvOverride::Applied {
        var: name,
        value: value.clone(),
    });
    Some(value)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MAX_SESSIONS: Override the session limit
    /// - SCROLLBACK_BUFFER_SIZE: Override the per-session replay buffer size
    /// - TETHER_SHELL: Override the shell
    /// - TETHER_BIND: Override the listen address
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Empty variables are skipped. Returns what was applied or ignored, in
    /// the order above, for the caller to log once tracing is up.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut report = Vec::new();

        if let Some(max) = env_number::<usize>("MAX_SESSIONS", &mut report) {
            self.session.max_sessions = max;
        }
        if let Some(size) = env_number::<usize>("SCROLLBACK_BUFFER_SIZE", &mut report) {
            self.session.scrollback_buffer_size = size;
        }
        if let Some(shell) = env_string("TETHER_SHELL", &mut report) {
            self.session.shell = shell;
        }
        if let Some(bind) = env_string("TETHER_BIND", &mut report) {
            self.server.bind = bind;
        }
        if let Some(level) = env_string("TETHER_LOG_LEVEL", &mut report) {
            self.daemon.log_level = level;
        }

        report
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.scrollback_buffer_size == 0 {
            return Err(ConfigError::InvalidScrollbackSize);
        }

        if self.server.outbox_capacity == 0 {
            return Err(ConfigError::InvalidOutboxCapacity);
        }

        if session.cols == 0 || session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: session.cols,
                rows: session.rows,
            });
        }

        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        // Absolute shells must exist; bare names are looked up on PATH.
        let shell_path = Path::new(&session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The listen address. Only meaningful after [`Config::validate`] passed.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
