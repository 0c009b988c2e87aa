//! Configuration types.

use crate::error::ConfigError;

/// Default number of users per message-listing call.
const DEFAULT_BATCH_SIZE: usize = 2;

/// Default cap on outstanding spam checks.
const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 5;

/// Default capacity of the handoff channel between two stages.
const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Pipeline configuration, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Users per `MessageLister::list_messages` call.
    pub batch_size: usize,
    /// Maximum number of `SpamClassifier::has_spam` calls in flight.
    pub max_concurrent_checks: usize,
    /// Buffer size of each inter-stage channel (1 = near-synchronous handoff).
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineConfig {
    /// Build a config from `SPAMSIFT_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let batch_size = std::env::var("SPAMSIFT_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let max_concurrent_checks = std::env::var("SPAMSIFT_MAX_CONCURRENT_CHECKS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_CHECKS);

        let channel_capacity = std::env::var("SPAMSIFT_CHANNEL_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);

        Self {
            batch_size,
            max_concurrent_checks,
            channel_capacity,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent_checks(mut self, max: usize) -> Self {
        self.max_concurrent_checks = max;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Reject values the stages cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("batch_size", self.batch_size),
            ("max_concurrent_checks", self.max_concurrent_checks),
            ("channel_capacity", self.channel_capacity),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.max_concurrent_checks, 5);
        assert_eq!(config.channel_capacity, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = PipelineConfig::default()
            .with_batch_size(0)
            .validate()
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "batch_size"),
        }
    }

    #[test]
    fn zero_concurrency_rejected() {
        let result = PipelineConfig::default()
            .with_max_concurrent_checks(0)
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn builder_setters_apply() {
        let config = PipelineConfig::default()
            .with_batch_size(10)
            .with_max_concurrent_checks(3)
            .with_channel_capacity(8);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_concurrent_checks, 3);
        assert_eq!(config.channel_capacity, 8);
    }
}
