// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::connection::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
use crate::dispatcher::DispatcherConfig;
use crate::errors::CalError;
use crate::status::Status;

pub const DEFAULT_ENVIRONMENT: &str = "PayPal";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_LABEL: &str = "rust;***;default";

/// Configuration for a CAL client
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the application, reported in the machine header
    pub pool: String,
    pub environment: String,
    /// Collector host
    pub host: String,
    pub port: u16,
    /// Events with a status above this are not sent. `"0"` sends everything.
    pub min_status: Status,
    /// Build label, reported in the machine header
    pub label: String,
    /// When false, every call is accepted and nothing is sent
    pub enabled: bool,
    pub connect_timeout: Duration,
    pub dispatcher: DispatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: String::new(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            min_status: Status::success(),
            label: DEFAULT_LABEL.to_string(),
            enabled: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration for `pool`.
    #[must_use]
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, CalError> {
        let defaults = Config::default();

        let pool = env::var("CAL_POOL").unwrap_or_default();
        let environment = env::var("CAL_ENVIRONMENT").unwrap_or(defaults.environment);
        let host = env::var("CAL_HOST").unwrap_or(defaults.host);
        let port = env::var("CAL_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(defaults.port);
        let min_status = env::var("CAL_MIN_STATUS")
            .map(Status::from)
            .unwrap_or(defaults.min_status);
        let label = env::var("CAL_LABEL").unwrap_or(defaults.label);
        let enabled = env::var("CAL_ENABLED")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);
        let queue_size = env::var("CAL_QUEUE_SIZE")
            .ok()
            .and_then(|size| size.parse::<usize>().ok())
            .unwrap_or(defaults.dispatcher.queue_size);
        let connect_timeout = env::var("CAL_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|secs| secs.parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(defaults.connect_timeout);

        let config = Self {
            pool,
            environment,
            host,
            port,
            min_status,
            label,
            enabled,
            connect_timeout,
            dispatcher: DispatcherConfig {
                queue_size,
                ..defaults.dispatcher
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CalError> {
        if self.pool.trim().is_empty() {
            return Err(CalError::InvalidConfig(
                "CAL pool name cannot be empty".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(CalError::InvalidConfig(
                "CAL collector host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(CalError::InvalidConfig(
                "CAL collector port must be greater than 0".to_string(),
            ));
        }

        if self.dispatcher.queue_size == 0 {
            return Err(CalError::InvalidConfig(
                "CAL queue size must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(CalError::InvalidConfig(
                "CAL connect timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
