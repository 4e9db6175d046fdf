//! Messaging (broker) configuration types.

use serde::Deserialize;

/// Broker discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ broker.
    Amqp,
    /// In-process channel broker (no external server).
    #[default]
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

impl MessagingConfig {
    pub fn channel() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            ..Self::default()
        }
    }

    pub fn amqp(url: impl Into<String>) -> Self {
        Self {
            messaging_type: MessagingType::Amqp,
            amqp: AmqpConfig { url: url.into() },
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
        }
    }
}
