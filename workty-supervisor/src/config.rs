use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key cannot be empty")]
    EmptyApiKey,

    #[error("Execution timeout must be at least 1 second")]
    InvalidExecuteTimeout,

    #[error("Sweep interval must be at least 1 second")]
    InvalidSweepInterval,

    #[error("Heartbeat interval must be at least 1 second")]
    InvalidHeartbeatInterval,
}

/// Validated runtime configuration for the supervisor
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub execute_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Create a new config with validation
    pub fn try_new(
        api_key: String,
        execute_timeout_secs: u64,
        sweep_interval_secs: u64,
        heartbeat_interval_secs: u64,
    ) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if execute_timeout_secs == 0 {
            return Err(ConfigError::InvalidExecuteTimeout);
        }
        if sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        if heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }

        Ok(Self {
            api_key,
            execute_timeout: Duration::from_secs(execute_timeout_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        let config = Config::try_new("secret".into(), 300, 30, 10).unwrap();
        assert_eq!(config.execute_timeout, Duration::from_secs(300));
    }

    #[test]
    fn empty_api_key_rejected() {
        assert!(matches!(
            Config::try_new("  ".into(), 300, 30, 10),
            Err(ConfigError::EmptyApiKey)
        ));
    }

    #[test]
    fn zero_intervals_rejected() {
        assert!(matches!(
            Config::try_new("k".into(), 0, 30, 10),
            Err(ConfigError::InvalidExecuteTimeout)
        ));
        assert!(matches!(
            Config::try_new("k".into(), 300, 0, 10),
            Err(ConfigError::InvalidSweepInterval)
        ));
        assert!(matches!(
            Config::try_new("k".into(), 300, 30, 0),
            Err(ConfigError::InvalidHeartbeatInterval)
        ));
    }
}
