//! Configuration loader with file and environment variable support

use crate::{ConfigError, FeedConfig};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "unifiedfeed.toml",
    "config.toml",
    "./config/unifiedfeed.toml",
    "./config/config.toml",
    "/etc/unifiedfeed/config.toml",
];

/// Environment variable naming an explicit config file
const CONFIG_ENV: &str = "UNIFIEDFEED_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides, then validate
    pub fn load(&self) -> Result<FeedConfig, ConfigError> {
        let mut config = FeedConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = FeedConfig::from_file(&path)?;
        } else {
            info!("No configuration file found, using defaults");
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching standard paths");
        }

        if let Ok(path) = env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut FeedConfig) {
        // AMQP
        if let Ok(val) = env::var("UNIFIEDFEED_AMQP_HOST") {
            config.amqp.host = val;
        }
        if let Some(port) = parse_env("UNIFIEDFEED_AMQP_PORT") {
            config.amqp.port = port;
        }
        if let Ok(val) = env::var("UNIFIEDFEED_AMQP_VHOST") {
            config.amqp.virtual_host = val;
        }
        if let Ok(val) = env::var("UNIFIEDFEED_ACCESS_TOKEN") {
            config.amqp.username = val.clone();
            config.api.access_token = val;
        }
        if let Ok(val) = env::var("UNIFIEDFEED_AMQP_PASSWORD") {
            config.amqp.password = val;
        }
        if let Some(tls) = parse_env("UNIFIEDFEED_AMQP_USE_TLS") {
            config.amqp.use_tls = tls;
        }
        if let Some(secs) = parse_env("UNIFIEDFEED_MAX_SILENCE_SECS") {
            config.amqp.max_silence_secs = secs;
        }
        if let Some(secs) = parse_env("UNIFIEDFEED_CHANNEL_CHECK_INTERVAL_SECS") {
            config.amqp.channel_check_interval_secs = secs;
        }

        // Producers
        if let Some(secs) = parse_env("UNIFIEDFEED_INACTIVITY_SECS") {
            config.producers.inactivity_seconds = secs;
        }
        if let Some(secs) = parse_env("UNIFIEDFEED_INACTIVITY_SECS_PREMATCH") {
            config.producers.inactivity_seconds_prematch = secs;
        }
        if let Some(secs) = parse_env("UNIFIEDFEED_MIN_RECOVERY_INTERVAL_SECS") {
            config.producers.min_interval_between_recovery_requests_secs = secs;
        }
        if let Some(secs) = parse_env("UNIFIEDFEED_MAX_RECOVERY_TIME_SECS") {
            config.producers.max_recovery_time_secs = secs;
        }
        if let Ok(val) = env::var("UNIFIEDFEED_DISABLED_PRODUCERS") {
            config.producers.disabled = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Ok(val) = env::var("UNIFIEDFEED_TIMESTAMP_STORE") {
            config.producers.timestamp_store_path = val;
        }

        // API
        if let Ok(val) = env::var("UNIFIEDFEED_API_BASE_URL") {
            config.api.base_url = val;
        }

        // General
        if let Some(node_id) = parse_env("UNIFIEDFEED_NODE_ID") {
            config.node_id = Some(node_id);
        }
        if let Some(replay) = parse_env("UNIFIEDFEED_REPLAY") {
            config.replay = replay;
        }
        if let Ok(val) = env::var("UNIFIEDFEED_SESSIONS") {
            config.sessions = val.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = env::var(name).ok()?;
    match val.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %val, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            sessions = ["live", "prematch"]
            [amqp]
            host = "mq.example.com"
            max_silence_secs = 120
            [producers]
            disabled = [7]
            "#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.amqp.host, "mq.example.com");
        assert_eq!(config.amqp.max_silence_secs, 120);
        assert_eq!(config.producers.disabled, vec![7]);
        assert_eq!(config.sessions, vec!["live".to_string(), "prematch".to_string()]);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[producers]\nmax_recovery_time_secs = 10").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[amqp\nhost = ").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
