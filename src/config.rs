//! # Configuration Management
//!
//! Centralized configuration for the message queue runtime.
//!
//! The runtime consumes this configuration but does not own where it comes from:
//! task pool size, read buffer size, shutdown drain timeout, auto-compress threshold,
//! UDP reader task count, TLS certificate/key paths and the default idle timeout.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::error::{ProtocolError, Result};
use crate::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Size of the fixed message head in bytes
pub const MSG_HEAD_SIZE: usize = 12;

/// Default maximum payload length accepted in a head (1 MiB)
pub const MAX_MSG_DATA_SIZE: u32 = 1024 * 1024;

/// Default idle timeout for a connection, in seconds
pub const DEFAULT_MSGQUE_TIMEOUT: u32 = 180;

/// Default depth of per-connection queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Upper bound on pooled worker tasks
    pub pool_size: usize,

    /// How long an idle pooled worker waits for more work before exiting
    #[serde(with = "duration_serde")]
    pub pool_idle_timeout: Duration,

    /// Read buffer size for stream transports
    pub read_buffer_size: usize,

    /// Maximum time to wait for tracked tasks during shutdown
    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,

    /// Payloads at or above this size are compressed before sending (0 = off)
    pub auto_compress_len: u32,

    /// Algorithm used for the compressed flag
    #[serde(default)]
    pub compression: CompressionKind,

    /// Number of reader tasks sharing one UDP socket
    pub udp_reader_count: usize,

    /// Certificate chain for `wss://` listeners
    pub tls_cert_path: Option<String>,

    /// Private key for `wss://` listeners
    pub tls_key_path: Option<String>,

    /// Idle timeout applied to new connections, in seconds
    pub default_timeout_secs: u32,

    /// Largest payload length accepted in a message head
    pub max_msg_data_size: u32,

    /// Depth of the per-connection outbound queue
    pub write_queue_capacity: usize,

    /// Depth of the per-peer inbound queue on UDP listeners
    pub read_queue_capacity: usize,

    /// Timeout for outbound dials
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 50_000,
            pool_idle_timeout: Duration::from_secs(30),
            read_buffer_size: 1 << 12,
            stop_timeout: Duration::from_millis(3000),
            auto_compress_len: 0,
            compression: CompressionKind::default(),
            udp_reader_count: 64,
            tls_cert_path: None,
            tls_key_path: None,
            default_timeout_secs: DEFAULT_MSGQUE_TIMEOUT,
            max_msg_data_size: MAX_MSG_DATA_SIZE,
            write_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(1),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("NETQUE_POOL_SIZE") {
            config.pool_size = val;
        }

        if let Some(val) = env_parse::<u64>("NETQUE_STOP_TIMEOUT_MS") {
            config.stop_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u32>("NETQUE_AUTO_COMPRESS_LEN") {
            config.auto_compress_len = val;
        }

        if let Some(val) = env_parse::<usize>("NETQUE_UDP_READER_COUNT") {
            config.udp_reader_count = val;
        }

        if let Some(val) = env_parse::<u32>("NETQUE_TIMEOUT_SECS") {
            config.default_timeout_secs = val;
        }

        if let Ok(path) = std::env::var("NETQUE_TLS_CERT_PATH") {
            config.tls_cert_path = Some(path);
        }

        if let Ok(path) = std::env::var("NETQUE_TLS_KEY_PATH") {
            config.tls_key_path = Some(path);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of problems. Empty list means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.pool_size == 0 {
            errors.push("Pool size must be greater than 0".to_string());
        }

        if self.read_buffer_size < 64 {
            errors.push(format!(
                "Read buffer too small: {} bytes (minimum: 64)",
                self.read_buffer_size
            ));
        }

        if self.stop_timeout.as_millis() < 10 {
            errors.push("Stop timeout too short (minimum: 10ms)".to_string());
        } else if self.stop_timeout.as_secs() > 300 {
            errors.push("Stop timeout too long (maximum: 300s)".to_string());
        }

        if self.max_msg_data_size == 0 {
            errors.push("Max message data size cannot be 0".to_string());
        }

        if self.auto_compress_len > self.max_msg_data_size {
            errors.push(
                "Auto compress length cannot be larger than max message data size".to_string(),
            );
        }

        if self.udp_reader_count == 0 {
            errors.push("UDP reader count must be greater than 0".to_string());
        }

        if self.write_queue_capacity == 0 || self.read_queue_capacity == 0 {
            errors.push("Queue capacities must be greater than 0".to_string());
        }

        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) => errors.push("tls_key_path must be set with tls_cert_path".into()),
            (None, Some(_)) => errors.push("tls_cert_path must be set with tls_key_path".into()),
            _ => {}
        }

        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Whether a `wss://` listener can be started with this configuration
    pub fn tls_configured(&self) -> bool {
        matches!(
            (&self.tls_cert_path, &self.tls_key_path),
            (Some(c), Some(k)) if !c.is_empty() && !k.is_empty()
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netque"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
