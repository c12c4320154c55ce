//! UnifiedFeed Client Configuration
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root feed client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub amqp: AmqpSettings,
    pub producers: ProducerSettings,
    pub api: ApiSettings,

    /// Node id appended to recovery requests and routing keys (multi-node setups)
    pub node_id: Option<i32>,

    /// Replay mode: availability gating is disabled because traffic is not live
    pub replay: bool,

    /// Message interests to open sessions for (all, live, prematch, hi, lo, virtual, system_alive)
    pub sessions: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            amqp: AmqpSettings::default(),
            producers: ProducerSettings::default(),
            api: ApiSettings::default(),
            node_id: None,
            replay: false,
            sessions: vec!["all".to_string()],
        }
    }
}

/// Broker connection and channel supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    /// The access token doubles as the broker username
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// Topic exchange the feed is published on
    pub exchange: String,
    /// AMQP heartbeat in seconds
    pub heartbeat_secs: u16,
    /// Channel health check period in seconds
    pub channel_check_interval_secs: u64,
    /// Max time without deliveries before a channel is recreated
    pub max_silence_secs: u64,
    /// Base delay for channel recreation backoff
    pub reconnect_backoff_base_secs: u64,
    /// Upper bound for channel recreation backoff
    pub reconnect_backoff_max_secs: u64,
    /// Client name reported to the broker
    pub client_name: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "stgmq.betradar.com".to_string(),
            port: 5671,
            virtual_host: "/".to_string(),
            username: String::new(),
            password: String::new(),
            use_tls: true,
            exchange: "unifiedfeed".to_string(),
            heartbeat_secs: 60,
            channel_check_interval_secs: 20,
            max_silence_secs: 180,
            reconnect_backoff_base_secs: 5,
            reconnect_backoff_max_secs: 300,
            client_name: "uf-client".to_string(),
        }
    }
}

impl AmqpSettings {
    /// Build the AMQP URI for these settings
    pub fn uri(&self) -> String {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };
        let vhost = self.virtual_host.replace('/', "%2f");
        format!(
            "{}://{}:{}@{}:{}/{}?heartbeat={}",
            scheme, self.username, self.password, self.host, self.port, vhost, self.heartbeat_secs
        )
    }
}

/// Producer liveness and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Inactivity threshold for live (and virtual) producers
    pub inactivity_seconds: u64,
    /// Inactivity threshold for prematch-only producers
    pub inactivity_seconds_prematch: u64,
    pub min_interval_between_recovery_requests_secs: u64,
    pub max_recovery_time_secs: u64,
    /// How often producer liveness and recovery deadlines are swept
    pub sweep_interval_secs: u64,
    /// Producer ids that are never recovered nor dispatched
    pub disabled: Vec<u32>,
    /// File holding per-producer recovery timestamps; empty disables persistence
    pub timestamp_store_path: String,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            inactivity_seconds: 20,
            inactivity_seconds_prematch: 60,
            min_interval_between_recovery_requests_secs: 30,
            max_recovery_time_secs: 3600,
            sweep_interval_secs: 10,
            disabled: Vec::new(),
            timestamp_store_path: "./data/producer-timestamps.json".to_string(),
        }
    }
}

/// Recovery API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub access_token: String,
    pub timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://stgapi.betradar.com".to_string(),
            access_token: String::new(),
            timeout_secs: 30,
        }
    }
}

impl FeedConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FeedConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check value ranges the broker and recovery API accept
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.amqp.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("amqp.host must not be empty".to_string()));
        }
        if self.amqp.exchange.trim().is_empty() {
            return Err(ConfigError::ValidationError("amqp.exchange must not be empty".to_string()));
        }
        if self.amqp.channel_check_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "amqp.channel_check_interval_secs must be positive".to_string(),
            ));
        }
        if self.amqp.max_silence_secs <= self.amqp.channel_check_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "amqp.max_silence_secs ({}) must exceed amqp.channel_check_interval_secs ({})",
                self.amqp.max_silence_secs, self.amqp.channel_check_interval_secs
            )));
        }
        if self.amqp.reconnect_backoff_base_secs > self.amqp.reconnect_backoff_max_secs {
            return Err(ConfigError::ValidationError(
                "amqp.reconnect_backoff_base_secs must not exceed amqp.reconnect_backoff_max_secs".to_string(),
            ));
        }

        check_range("producers.inactivity_seconds", self.producers.inactivity_seconds, 20, 180)?;
        check_range(
            "producers.inactivity_seconds_prematch",
            self.producers.inactivity_seconds_prematch,
            20,
            180,
        )?;
        check_range(
            "producers.min_interval_between_recovery_requests_secs",
            self.producers.min_interval_between_recovery_requests_secs,
            20,
            180,
        )?;
        check_range(
            "producers.max_recovery_time_secs",
            self.producers.max_recovery_time_secs,
            600,
            86_400,
        )?;
        if self.producers.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "producers.sweep_interval_secs must be positive".to_string(),
            ));
        }

        if self.sessions.is_empty() {
            return Err(ConfigError::ValidationError("at least one session is required".to_string()));
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# UnifiedFeed Client Configuration
# Environment variables (UNIFIEDFEED_*) override these settings

node_id = 1
replay = false
sessions = ["all"]  # all, live, prematch, hi, lo, virtual, system_alive

[amqp]
host = "stgmq.betradar.com"
port = 5671
virtual_host = "/"
username = ""  # access token
password = ""
use_tls = true
exchange = "unifiedfeed"
heartbeat_secs = 60
channel_check_interval_secs = 20
max_silence_secs = 180
reconnect_backoff_base_secs = 5
reconnect_backoff_max_secs = 300
client_name = "uf-client"

[producers]
inactivity_seconds = 20
inactivity_seconds_prematch = 60
min_interval_between_recovery_requests_secs = 30
max_recovery_time_secs = 3600
sweep_interval_secs = 10
disabled = []
timestamp_store_path = "./data/producer-timestamps.json"

[api]
base_url = "https://stgapi.betradar.com"
access_token = ""
timeout_secs = 30
"#
        .to_string()
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::ValidationError(format!(
            "{} must be between {} and {} (got {})",
            name, min, max, value
        )));
    }
    Ok(())
}
