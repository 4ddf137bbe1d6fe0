//! Configuration for the resilient MQTT client layer.
//!
//! All types derive `serde::Deserialize`, so they load from TOML, JSON or
//! YAML; the loading mechanism itself is up to the application. Validation
//! uses the `validator` crate so invalid settings fail at build time, not at
//! connect time.
//!
//! Two independent retry configurations exist per client: one for connect
//! operations and one for publish operations. They are never shared or
//! merged.
//!
//! # Examples
//!
//! ```ignore
//! let config: Config = toml::from_str(r#"
//!     server_uri = "tcp://mqtt.example.com:1883"
//!     client_id = "gateway-01"
//!     clean_session = false
//!
//!     [connect]
//!     max_attempts = 10
//!     backoff = "exponential"
//! "#)?;
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// The shape of the function mapping attempt count to retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant interval: every retry waits the base interval.
    Fixed,
    /// Interval grows linearly: `base * attempt`, capped at the maximum.
    Linear,
    /// Interval grows geometrically: `base * multiplier^(attempt - 1)`,
    /// capped at the maximum.
    #[default]
    Exponential,
}

/// Retry and backoff settings for one operation class.
///
/// Attempt arithmetic is 1-based: the first try is attempt 1, and retries
/// stop once the attempt count reaches `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether retries are enabled for this operation class.
    ///
    /// When false, the first failure is terminal.
    pub enabled: bool,

    /// Maximum number of attempts, including the first one.
    #[validate(range(min = 1, message = "Max attempts must be at least 1"))]
    pub max_attempts: u32,

    /// Base retry interval in milliseconds.
    pub base_interval_ms: u64,

    /// Upper bound on the retry interval in milliseconds.
    ///
    /// Linear and exponential intervals are clamped to this value.
    pub max_interval_ms: u64,

    /// Growth factor for the exponential shape.
    #[validate(range(min = 1.0, message = "Multiplier must be at least 1.0"))]
    pub multiplier: f64,

    /// Which backoff shape to use.
    pub backoff: BackoffKind,
}

impl RetryConfig {
    /// Defaults for the connect operation class.
    ///
    /// Connects back off gently and keep trying for a while: brokers that
    /// just restarted often need tens of seconds to accept clients again.
    pub fn connect_default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_interval_ms: 5_000,
            max_interval_ms: 30_000,
            multiplier: 1.5,
            backoff: BackoffKind::Exponential,
        }
    }

    /// Defaults for the publish operation class.
    ///
    /// Publishes give up quickly: the caller is usually waiting, and a
    /// sustained outage is the connect policy's problem.
    pub fn publish_default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_interval_ms: 1_000,
            max_interval_ms: 5_000,
            multiplier: 1.2,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connect_default()
    }
}

/// Main configuration for the client layer.
///
/// Covers the connection options handed to the transport plus the two retry
/// configurations. All fields have defaults, so a minimal TOML file only
/// needs to override what differs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker address, e.g. `tcp://localhost:1883` or `ssl://host:8883`.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Server URI must be between 1 and 255 characters"
    ))]
    pub server_uri: String,

    /// Client identifier presented to the broker.
    ///
    /// Empty means a unique id is generated at build time (see
    /// [`Config::effective_client_id`]).
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Username for broker authentication, if the broker requires one.
    pub username: Option<String>,

    /// Password for broker authentication, if the broker requires one.
    pub password: Option<String>,

    /// Connect timeout in seconds, enforced by the transport.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Whether to request a clean session from the broker.
    pub clean_session: bool,

    /// Whether lost connections are automatically re-established.
    ///
    /// When false, a connection loss leaves the client disconnected until
    /// the application rebuilds it.
    pub automatic_reconnect: bool,

    /// Pause in milliseconds between a reconnect acknowledgment and the
    /// resubscription pass, letting the fresh session stabilize before
    /// subscribe traffic is issued.
    #[validate(range(max = 60_000, message = "Settle delay must not exceed 60 seconds"))]
    pub settle_delay_ms: u64,

    /// Whether the periodic connection health probe runs.
    ///
    /// The probe is a safety net against a missed connect event; the
    /// resubscription it may trigger is idempotent.
    pub health_probe: bool,

    /// Retry settings for connect operations.
    #[validate]
    pub connect: RetryConfig,

    /// Retry settings for publish operations.
    #[validate]
    pub publish: RetryConfig,
}

impl Config {
    /// Returns the configured client id, or a generated one when empty.
    ///
    /// Generated ids are unique per call; compute once at build time and
    /// reuse for every reconnect so the broker sees a stable identity.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.trim().is_empty() {
            format!("mqtt-guardian-{}", Uuid::new_v4())
        } else {
            self.client_id.clone()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: "tcp://localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            connection_timeout: 30,
            keep_alive: 60,
            clean_session: true,
            automatic_reconnect: true,
            settle_delay_ms: 2_000,
            health_probe: true,
            connect: RetryConfig::connect_default(),
            publish: RetryConfig::publish_default(),
        }
    }
}
