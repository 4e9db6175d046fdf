//! Dispatcher loop configuration.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::broker::AckMode;

/// Settings shared by every consumer dispatcher loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// When deliveries are acknowledged.
    pub ack_mode: AckMode,
    /// Deliveries processed at once per loop.
    pub concurrency: usize,
    /// First reconnect delay after the delivery stream ends.
    pub reconnect_min_delay_ms: u64,
    /// Reconnect delay ceiling.
    pub reconnect_max_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Auto,
            concurrency: 1,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "consumer.concurrency must be at least 1".to_string(),
            ));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "consumer.reconnect_min_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_min_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ConsumerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_min_delay(), Duration::from_millis(100));
        assert_eq!(config.reconnect_max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_inverted_delays_are_invalid() {
        let config = ConsumerConfig {
            reconnect_min_delay_ms: 5_000,
            reconnect_max_delay_ms: 10,
            ..ConsumerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
