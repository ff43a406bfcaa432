//! Configuration for the frame sink service.
//!
//! Configuration is loaded in the following order (later sources override earlier):
//! 1. `config/default.toml`
//! 2. `config/{RUN_MODE}.toml`
//! 3. `/etc/framesink/sink.toml`
//! 4. Environment variables prefixed with `FRAMESINK` (e.g. `FRAMESINK__STREAM__ENDPOINT`)

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the frame sink
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Key-value (memcached) backend
    pub key_value: KeyValueConfig,
    /// Stream (Redis) backend
    pub stream: StreamConfig,
    /// Frame geometry and sensor metadata
    pub frame: FrameConfig,
    /// Publishing behaviour
    #[serde(default)]
    pub sink: SinkConfig,
    /// Raw frame input
    #[serde(default)]
    pub input: InputConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// What to do when a backend cannot be reached at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Refuse to start
    Abort,
    /// Start with the backend disabled; its writes are logged as failures
    Disable,
}

/// Whether the stream append depends on the payload put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppendPolicy {
    /// Append after every put attempt, whatever its outcome
    #[default]
    Always,
    /// Append only when the payload was stored
    RequireStored,
}

/// Memcached connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValueConfig {
    /// UNIX socket path or `host:port`
    pub endpoint: String,
    /// Use the binary protocol (ASCII when false)
    #[serde(default = "default_true")]
    pub binary_protocol: bool,
    /// Behaviour when the connection cannot be established
    #[serde(default = "default_key_value_failure_policy")]
    pub on_connect_failure: FailurePolicy,
    /// Connect timeout in milliseconds; the client's 30 s pool wait when unset
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Read/write timeout in milliseconds; blocking forever when unset
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
}

/// Redis stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// `host:port`
    pub endpoint: String,
    /// Stream name
    #[serde(default = "default_stream_key")]
    pub stream_key: String,
    /// Maximum retained entries
    #[serde(default = "default_max_len")]
    pub max_len: u64,
    /// Use `MAXLEN ~` (approximate trimming)
    #[serde(default = "default_true")]
    pub approximate_trim: bool,
    /// Use the frame key as the entry id instead of a server-assigned id
    #[serde(default = "default_true")]
    pub use_key_as_entry_id: bool,
    /// Behaviour when the connection cannot be established
    #[serde(default = "default_stream_failure_policy")]
    pub on_connect_failure: FailurePolicy,
    /// Connect timeout in milliseconds
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Read/write timeout in milliseconds; blocking forever when unset
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
}

/// Frame geometry and sensor metadata attached to every record
#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    /// Analogue gain reported in the metadata record
    #[serde(default)]
    pub gain: f32,
    /// Region-of-interest descriptor
    #[serde(default = "default_roi")]
    pub roi: String,
    /// Sensor identifier
    #[serde(default = "default_sensor_id")]
    pub sensor_id: String,
}

/// Publishing behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub append_policy: AppendPolicy,
    /// Flags stored alongside every payload
    #[serde(default = "default_value_flags")]
    pub value_flags: u32,
    /// Payload expiry in seconds (0 = never)
    #[serde(default)]
    pub ttl_secs: u32,
    /// Run the health check once the backends are connected
    #[serde(default = "default_true")]
    pub self_test_on_start: bool,
    /// Timeout for each backend's health check
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

/// Raw frame input
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InputConfig {
    /// File or FIFO to read frames from; stdin when unset
    #[serde(default)]
    pub path: Option<String>,
    /// Bytes per input frame; `width * height` when unset
    #[serde(default)]
    pub frame_bytes: Option<usize>,
}

// Default value functions
fn default_service_name() -> String {
    "frame-sink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_key_value_failure_policy() -> FailurePolicy {
    FailurePolicy::Disable
}

fn default_stream_failure_policy() -> FailurePolicy {
    FailurePolicy::Abort
}

fn default_stream_key() -> String {
    "Bitmaps".to_string()
}

fn default_max_len() -> u64 {
    1000
}

fn default_roi() -> String {
    "0,0,0,0".to_string()
}

fn default_sensor_id() -> String {
    "Libcamera".to_string()
}

fn default_value_flags() -> u32 {
    16
}

fn default_health_timeout_ms() -> u64 {
    2000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            append_policy: AppendPolicy::default(),
            value_flags: default_value_flags(),
            ttl_secs: 0,
            self_test_on_start: true,
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = ConfigBuilder::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("/etc/framesink/sink").required(false))
            // FRAMESINK__KEY_VALUE__ENDPOINT -> key_value.endpoint
            .add_source(
                Environment::with_prefix("FRAMESINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    ///
    /// Endpoint syntax is checked when the backends connect, so that a
    /// malformed endpoint surfaces as that backend's configuration error.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.key_value.endpoint.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "key_value.endpoint".to_string(),
            ));
        }

        if self.stream.endpoint.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "stream.endpoint".to_string(),
            ));
        }

        if self.stream.stream_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "stream.stream_key".to_string(),
            ));
        }

        if self.stream.max_len == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.max_len".to_string(),
                message: "Stream length cap must be greater than 0".to_string(),
            });
        }

        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "frame.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if let Some(frame_bytes) = self.input.frame_bytes {
            if frame_bytes < self.frame.pixel_count() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "input.frame_bytes".to_string(),
                    message: format!(
                        "{} bytes cannot hold a {}x{} luma plane",
                        frame_bytes, self.frame.width, self.frame.height
                    ),
                });
            }
        }

        let timeouts = [
            ("key_value.connect_timeout_ms", self.key_value.connect_timeout_ms),
            ("key_value.io_timeout_ms", self.key_value.io_timeout_ms),
            ("stream.connect_timeout_ms", self.stream.connect_timeout_ms),
            ("stream.io_timeout_ms", self.stream.io_timeout_ms),
        ];
        for (field, timeout) in timeouts {
            if timeout == Some(0) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "Timeout must be greater than 0; leave it unset to block".to_string(),
                });
            }
        }

        if self.sink.health_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sink.health_timeout_ms".to_string(),
                message: "Health check timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Bytes per input frame
    pub fn input_frame_bytes(&self) -> usize {
        self.input
            .frame_bytes
            .unwrap_or_else(|| self.frame.pixel_count())
    }
}

impl FrameConfig {
    /// Bytes in one Gray8 frame
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl KeyValueConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

impl SinkConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            key_value: KeyValueConfig {
                endpoint: "localhost:11211".to_string(),
                binary_protocol: true,
                on_connect_failure: FailurePolicy::Disable,
                connect_timeout_ms: None,
                io_timeout_ms: None,
            },
            stream: StreamConfig {
                endpoint: "localhost:6379".to_string(),
                stream_key: default_stream_key(),
                max_len: default_max_len(),
                approximate_trim: true,
                use_key_as_entry_id: true,
                on_connect_failure: FailurePolicy::Abort,
                connect_timeout_ms: None,
                io_timeout_ms: None,
            },
            frame: FrameConfig {
                width: 64,
                height: 48,
                gain: 1.5,
                roi: default_roi(),
                sensor_id: default_sensor_id(),
            },
            sink: SinkConfig::default(),
            input: InputConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_frame_bytes(), 64 * 48);
    }

    #[test]
    fn test_publishing_defaults() {
        let sink = SinkConfig::default();
        assert_eq!(sink.value_flags, 16);
        assert_eq!(sink.ttl_secs, 0);
        assert_eq!(sink.append_policy, AppendPolicy::Always);
        assert_eq!(default_stream_key(), "Bitmaps");
        assert_eq!(default_max_len(), 1000);
        assert_eq!(default_key_value_failure_policy(), FailurePolicy::Disable);
        assert_eq!(default_stream_failure_policy(), FailurePolicy::Abort);
    }

    #[test]
    fn test_missing_endpoint() {
        let mut config = create_test_config();
        config.stream.endpoint = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_dimensions() {
        let mut config = create_test_config();
        config.frame.height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_frame_bytes_smaller_than_luma_plane() {
        let mut config = create_test_config();
        config.input.frame_bytes = Some(100);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));

        config.input.frame_bytes = Some(64 * 48 * 3 / 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.input_frame_bytes(), 4608);
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = create_test_config();
        config.key_value.io_timeout_ms = Some(0);
        match config.validate() {
            Err(ConfigValidationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "key_value.io_timeout_ms")
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut config = create_test_config();
        config.key_value.connect_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.stream.connect_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.stream.io_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        config.stream.io_timeout_ms = Some(1);
        config.key_value.connect_timeout_ms = Some(250);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.key_value.connect_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml = r#"
            [key_value]
            endpoint = "/var/run/memcached.sock"

            [stream]
            endpoint = "redis:6379"
            on_connect_failure = "disable"

            [frame]
            width = 640
            height = 480
            gain = 2.0

            [sink]
            append_policy = "require_stored"
        "#;

        let config: Config = ConfigBuilder::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.stream.on_connect_failure, FailurePolicy::Disable);
        assert_eq!(config.key_value.on_connect_failure, FailurePolicy::Disable);
        assert_eq!(config.sink.append_policy, AppendPolicy::RequireStored);
        assert_eq!(config.stream.stream_key, "Bitmaps");
        assert_eq!(config.frame.roi, "0,0,0,0");
        assert_eq!(config.service.log_format, "json");
        assert!(config.validate().is_ok());
    }
}
