// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::deadlock::DEFAULT_DEADLOCK_TIMEOUT;
use crate::error::PublishError;
use crate::transport::ClientSettings;
use crate::window::DEFAULT_START_WINDOW_SIZE;
use std::env;
use std::time::Duration;

pub const DEFAULT_BULK_MAX_SIZE: usize = 2048;
pub const DEFAULT_PIPELINING: usize = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;
pub const DEFAULT_BACKOFF_INIT: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Configuration for the asynchronous publisher
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// Start with a small window and grow it as slices get acknowledged
    pub slow_start: bool,
    /// Initial window when slow start is enabled
    pub slow_start_window: usize,
    /// Maximum number of events per slice, and the window ceiling
    pub bulk_max_size: usize,
    /// Number of slices that may be in flight on one connection
    pub pipelining: usize,
    /// Time to wait for the acknowledgment of a slice
    pub timeout: Duration,
    /// Compression level applied by the wire encoder (0 disables compression)
    pub compression_level: u32,
    /// Not supported by the async publisher, only warned about
    pub ttl: Option<Duration>,
    /// Time a batch may go without acknowledgment progress before the connection is closed
    pub deadlock_timeout: Duration,
    /// First wait after a failed publish or connect
    pub backoff_init: Duration,
    /// Upper bound of the wait between retries
    pub backoff_max: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            slow_start: false,
            slow_start_window: DEFAULT_START_WINDOW_SIZE,
            bulk_max_size: DEFAULT_BULK_MAX_SIZE,
            pipelining: DEFAULT_PIPELINING,
            timeout: DEFAULT_TIMEOUT,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            ttl: None,
            deadlock_timeout: DEFAULT_DEADLOCK_TIMEOUT,
            backoff_init: DEFAULT_BACKOFF_INIT,
            backoff_max: DEFAULT_BACKOFF_MAX,
            log_level: "info".to_string(),
        }
    }
}

impl PublisherConfig {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, PublishError> {
        let defaults = Self::default();
        let config = Self {
            slow_start: env::var("LOGSTASH_SLOW_START")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(defaults.slow_start),
            slow_start_window: parse_env("LOGSTASH_SLOW_START_WINDOW")
                .unwrap_or(defaults.slow_start_window),
            bulk_max_size: parse_env("LOGSTASH_BULK_MAX_SIZE").unwrap_or(defaults.bulk_max_size),
            pipelining: parse_env("LOGSTASH_PIPELINING").unwrap_or(defaults.pipelining),
            timeout: parse_env("LOGSTASH_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            compression_level: parse_env("LOGSTASH_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression_level),
            ttl: parse_env("LOGSTASH_TTL")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            deadlock_timeout: parse_env("LOGSTASH_DEADLOCK_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.deadlock_timeout),
            backoff_init: parse_env("LOGSTASH_BACKOFF_INIT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_init),
            backoff_max: parse_env("LOGSTASH_BACKOFF_MAX")
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_max),
            log_level: env::var("LOGSTASH_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PublishError> {
        if self.bulk_max_size == 0 {
            return Err(PublishError::InvalidConfig(
                "bulk_max_size must be greater than 0".to_string(),
            ));
        }

        if self.slow_start_window == 0 {
            return Err(PublishError::InvalidConfig(
                "slow_start_window must be greater than 0".to_string(),
            ));
        }

        if self.pipelining == 0 {
            return Err(PublishError::InvalidConfig(
                "pipelining must be greater than 0".to_string(),
            ));
        }

        if self.compression_level > 9 {
            return Err(PublishError::InvalidConfig(format!(
                "compression_level {} is out of range 0..=9",
                self.compression_level
            )));
        }

        if self.backoff_init > self.backoff_max {
            return Err(PublishError::InvalidConfig(
                "backoff_init must not exceed backoff_max".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(PublishError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Settings handed to the protocol client
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            queue_size: self.pipelining.saturating_sub(1),
            timeout: self.timeout,
            compression_level: self.compression_level,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
