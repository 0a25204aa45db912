//! Client configuration.
//!
//! Supports configuration from:
//! - TOML file
//! - Environment variables with `MQSESSION__` prefix
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! ```toml
//! max_queue_depth = 256
//! reconnect_base_delay_ms = 500
//! reconnect_max_attempts = 10
//! session_persistence = "persistent"
//! password = "${BROKER_PASSWORD:-}"
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
pub const DEFAULT_LOOP_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_MAX_INFLIGHT_MESSAGES: u16 = 20;

/// What happens to unacknowledged operations when the connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPersistence {
    /// Discard pending operations on every disconnect, firing a synthetic
    /// failure callback for each. Connects with a clean session.
    #[default]
    Clean,
    /// Keep pending operations across reconnects and let the broker session
    /// complete them. Connects with a persistent session.
    Persistent,
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Event queue capacity between the network and dispatcher threads.
    pub max_queue_depth: usize,
    /// First reconnect delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Delay growth factor between attempts.
    pub reconnect_multiplier: f64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Maximum reconnect attempts (0 = unlimited).
    pub reconnect_max_attempts: u32,
    /// Fraction of each backoff step randomised (0.0 - 1.0).
    pub reconnect_jitter: f64,
    /// Reconnect automatically after an unexpected connection loss.
    pub auto_reconnect: bool,
    /// In-flight operation policy on disconnect.
    pub session_persistence: SessionPersistence,
    /// Time allowed for the broker to accept a connection.
    pub connect_timeout_ms: u64,
    /// Keep-alive interval in seconds used by `connect_to` (0 = disabled).
    pub keep_alive: u16,
    /// Cap on QoS > 0 publishes awaiting acknowledgment (0 = unlimited).
    pub max_inflight_messages: u16,
    /// Upper bound on one engine loop iteration in milliseconds.
    pub loop_timeout_ms: u64,
    /// Re-issue subscriptions after a clean-session reconnect.
    pub resubscribe_on_reconnect: bool,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Default log filter for binaries embedding the client.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_multiplier: 2.0,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: 0,
            reconnect_jitter: 0.0,
            auto_reconnect: true,
            session_persistence: SessionPersistence::Clean,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
            loop_timeout_ms: DEFAULT_LOOP_TIMEOUT_MS,
            resubscribe_on_reconnect: true,
            username: None,
            password: None,
            log_level: "info".to_string(),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` with environment values.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
}

impl ClientConfig {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// A missing file yields the defaults. Variables such as
    /// `MQSESSION__MAX_QUEUE_DEPTH=64` override file values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQSESSION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ClientConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: ClientConfig = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "max_queue_depth must be at least 1".into(),
            ));
        }
        if !(self.reconnect_multiplier >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "reconnect_multiplier must be >= 1.0, got {}",
                self.reconnect_multiplier
            )));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigError::Validation(format!(
                "reconnect_jitter must be within 0.0..=1.0, got {}",
                self.reconnect_jitter
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.loop_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "loop_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn loop_timeout(&self) -> Duration {
        Duration::from_millis(self.loop_timeout_ms)
    }

    /// Whether connections ask the broker for a clean session.
    pub fn clean_session(&self) -> bool {
        self.session_persistence == SessionPersistence::Clean
    }

    /// Set the event queue capacity.
    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the reconnect schedule.
    pub fn reconnect_backoff(mut self, base: Duration, multiplier: f64, max: Duration) -> Self {
        self.reconnect_base_delay_ms = base.as_millis() as u64;
        self.reconnect_multiplier = multiplier;
        self.reconnect_max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the maximum reconnect attempts (0 = unlimited).
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the backoff jitter fraction.
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the in-flight policy on disconnect.
    pub fn session_persistence(mut self, persistence: SessionPersistence) -> Self {
        self.session_persistence = persistence;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the cap on unacknowledged QoS > 0 publishes (0 = unlimited).
    pub fn max_inflight_messages(mut self, max: u16) -> Self {
        self.max_inflight_messages = max;
        self
    }

    /// Set the engine iteration timeout.
    pub fn loop_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.loop_timeout_ms = timeout_ms;
        self
    }

    /// Enable or disable resubscription after a clean reconnect.
    pub fn resubscribe_on_reconnect(mut self, enabled: bool) -> Self {
        self.resubscribe_on_reconnect = enabled;
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}
