//! Connection configuration
//!
//! [`ServerConfig`] and [`TransportSettings`] are the immutable values the
//! streamer is built from. [`StreamerConfig`] groups them for loading from a
//! TOML file:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 5672
//! vhost = "/"
//! username = "guest"
//! password_env = "BROKER_PASSWORD"
//!
//! [transport]
//! connect_timeout_ms = 500
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Broker endpoint and credentials
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_guest() -> String {
    "guest".to_string()
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            vhost: default_vhost(),
            username: default_guest(),
            password: default_guest(),
        }
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "server.host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.port must be greater than 0".to_string(),
            ));
        }
        if self.vhost.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "server.vhost must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// Keep the password out of logs
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Socket and buffer sizing for the transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportSettings {
    /// Bound on resolve + connect (default: 500)
    pub connect_timeout_ms: u64,
    /// Size of the per-read scratch buffer (default: 4 KiB)
    pub read_buffer_size: usize,
    /// Capacity of the input accumulator (default: 8 KiB)
    pub accumulator_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 500,
            read_buffer_size: 4 * 1024,
            accumulator_capacity: 8 * 1024,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.accumulator_capacity < self.read_buffer_size {
            return Err(ConfigError::InvalidConfig(format!(
                "transport.accumulator_capacity ({}) must be at least read_buffer_size ({})",
                self.accumulator_capacity, self.read_buffer_size
            )));
        }
        Ok(())
    }
}

/// Server section as written in the file, before secrets are resolved
#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    #[serde(flatten)]
    server: ServerConfig,
    /// Environment variable overriding `password`
    password_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    server: ServerSection,
    #[serde(default)]
    transport: TransportSettings,
}

/// Full configuration loaded from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerConfig {
    pub server: ServerConfig,
    pub transport: TransportSettings,
}

/// Configuration loading errors
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

impl StreamerConfig {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            transport: TransportSettings::default(),
        }
    }

    /// Load configuration from a TOML file, resolving `password_env`
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;

        let mut server = file.server.server;
        if let Some(env_name) = &file.server.password_env {
            server.password = get_env_var_required(env_name)?;
        }

        let config = Self {
            server,
            transport: file.transport,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.transport.validate()
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}
