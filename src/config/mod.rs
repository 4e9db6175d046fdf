//! Configuration types for microbus.
//!
//! Configuration sources (in order of priority, later overrides earlier):
//! 1. `microbus.yaml` in the current directory (if exists)
//! 2. File passed to `Config::load`
//! 3. File named by `MICROBUS_CONFIG`
//! 4. Environment variables prefixed `MICROBUS`, nested with `__`
//!    (`MICROBUS__CONSUMER__CONCURRENCY=4`)

mod consumer;
mod messaging;

pub use consumer::ConsumerConfig;
pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "microbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MICROBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MICROBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MICROBUS_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker selection and connection settings.
    pub messaging: MessagingConfig,
    /// Dispatcher loop settings.
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.consumer.validate()?;
        Ok(config)
    }
}
