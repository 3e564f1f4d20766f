//! Configuration for devlink sessions
//!
//! Loaded from TOML. Credentials never live in the file: the file names the
//! environment variables that hold them, and they are read at connect time.

use crate::protocol::topics::validate_device_id;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevlinkConfig {
    pub session: SessionConfig,
    #[serde(default)]
    pub http: Option<HttpSection>,
}

/// Broker session settings; fixed once a session connects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// `mqtt://`, `mqtts://`, `tcp://` or `ssl://` URL with optional port
    pub broker_url: String,
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Start without any broker-side session state
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_initial_reconnect_backoff")]
    pub initial_reconnect_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_backoff")]
    pub max_reconnect_backoff_ms: u64,
    /// Give up after this many reconnection attempts (None = never)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// QoS 0 messages held while the connection is down
    #[serde(default = "default_offline_queue_limit")]
    pub offline_queue_limit: usize,
    #[serde(default = "default_true")]
    pub flush_on_close: bool,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    #[serde(default)]
    pub credentials: Option<CredentialsSection>,
    #[serde(default)]
    pub delivery: DeliverySection,
    /// Announce this side as a device (register, heartbeat, online status)
    #[serde(default)]
    pub presence: Option<PresenceSection>,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_initial_reconnect_backoff() -> u64 {
    500
}

fn default_max_reconnect_backoff() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_offline_queue_limit() -> usize {
    256
}

fn default_close_timeout() -> u64 {
    2000
}

/// Names of the environment variables holding broker credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    pub username_env: String,
    #[serde(default)]
    pub password_env: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialsSection {
    pub fn resolve(&self) -> Result<Credentials, ConfigError> {
        let username = get_env_var_required(&self.username_env)?;
        let password = match &self.password_env {
            Some(name) => get_env_var_required(name)?,
            None => String::new(),
        };
        Ok(Credentials { username, password })
    }
}

/// Retry policy for QoS 1/2 deliveries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySection {
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How often the retry scan runs
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval(),
            max_retries: default_max_retries(),
            max_in_flight: default_max_in_flight(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_retry_interval() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_tick_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    pub device_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_capabilities() -> Vec<String> {
    vec![
        "display".to_string(),
        "audio".to_string(),
        "touch".to_string(),
    ]
}

impl PresenceSection {
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            capabilities: default_capabilities(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.device_id)
    }
}

/// HTTP collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn get_env_var_required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

impl DevlinkConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DevlinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if let Some(http) = &self.http {
            Url::parse(&http.base_url)
                .map_err(|e| invalid(format!("http.base_url '{}': {e}", http.base_url)))?;
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Configuration with every tunable at its default
    pub fn new<U: Into<String>, C: Into<String>>(broker_url: U, client_id: C) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            keep_alive_secs: default_keep_alive(),
            clean_session: false,
            auto_reconnect: true,
            initial_reconnect_backoff_ms: default_initial_reconnect_backoff(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff(),
            max_reconnect_attempts: None,
            connect_timeout_secs: default_connect_timeout(),
            offline_queue_limit: default_offline_queue_limit(),
            flush_on_close: true,
            close_timeout_ms: default_close_timeout(),
            credentials: None,
            delivery: DeliverySection::default(),
            presence: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_url.trim().is_empty() {
            return Err(invalid("broker_url cannot be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("client_id cannot be empty"));
        }

        let url = Url::parse(&self.broker_url)
            .map_err(|e| invalid(format!("broker_url '{}': {e}", self.broker_url)))?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
            return Err(invalid(format!(
                "broker_url scheme '{}' is not one of mqtt, mqtts, tcp, ssl",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(invalid(format!("broker_url '{}' has no host", self.broker_url)));
        }

        if self.keep_alive_secs > u64::from(u16::MAX) {
            return Err(invalid("keep_alive_secs cannot exceed 65535"));
        }
        if self.initial_reconnect_backoff_ms == 0 {
            return Err(invalid("initial_reconnect_backoff_ms must be greater than 0"));
        }
        if self.max_reconnect_backoff_ms < self.initial_reconnect_backoff_ms {
            return Err(invalid(
                "max_reconnect_backoff_ms must be at least initial_reconnect_backoff_ms",
            ));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(invalid(
                "max_reconnect_attempts must be greater than 0 or unset for unlimited",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs must be greater than 0"));
        }
        if self.delivery.retry_interval_ms == 0 || self.delivery.tick_interval_ms == 0 {
            return Err(invalid("delivery intervals must be greater than 0"));
        }
        if self.delivery.max_in_flight == 0 || self.delivery.max_in_flight > usize::from(u16::MAX) {
            return Err(invalid("delivery.max_in_flight must be between 1 and 65535"));
        }

        if let Some(presence) = &self.presence {
            validate_device_id(&presence.device_id)
                .map_err(|e| invalid(format!("presence.device_id: {e}")))?;
            if presence.heartbeat_interval_secs == 0 {
                return Err(invalid("presence.heartbeat_interval_secs must be greater than 0"));
            }
        }

        Ok(())
    }

    /// Resolve credentials from the environment, if configured
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        self.credentials.as_ref().map(CredentialsSection::resolve).transpose()
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn initial_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_backoff_ms)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.delivery.tick_interval_ms)
    }
}
