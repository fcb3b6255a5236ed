// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus Configuration
//!
//! This module defines the read-only configuration consumed by the bus:
//! broker connection settings, site identity, queue limits, training queue
//! overrides, retry policy, and monitoring intervals. All sections carry
//! defaults suitable for local development and are validated before any
//! broker I/O happens.

use crate::{errors::BusError, topology::Site};
use serde::Deserialize;

/// Top-level configuration for the cross-site message bus.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    pub connection: ConnectionSettings,
    pub site: SiteSettings,
    pub queues: QueueSettings,
    pub training_queues: TrainingQueueSettings,
    pub retry: RetrySettings,
    pub monitoring: MonitoringSettings,
}

impl MessageBusConfig {
    /// Validates every configuration section.
    ///
    /// Fails fast with a `ConfigurationError` so the bus never touches the
    /// broker with out-of-range settings.
    pub fn validate(&self) -> Result<(), BusError> {
        self.connection.validate()?;
        self.site.validate()?;
        self.queues.validate()?;
        self.training_queues.validate()?;
        self.retry.validate()?;
        self.monitoring.validate()
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub connection_timeout_secs: u64,
    pub automatic_recovery: bool,
    pub heartbeat_secs: u16,
    pub use_tls: bool,
    pub tls_server_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            virtual_host: "/".to_owned(),
            connection_timeout_secs: 30,
            automatic_recovery: true,
            heartbeat_secs: 60,
            use_tls: false,
            tls_server_name: None,
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.host.trim().is_empty() {
            return Err(BusError::ConfigurationError(
                "host cannot be empty".to_owned(),
            ));
        }

        if self.port == 0 {
            return Err(BusError::ConfigurationError(
                "port must be between 1 and 65535".to_owned(),
            ));
        }

        if !(5..=300).contains(&self.connection_timeout_secs) {
            return Err(BusError::ConfigurationError(
                "connection timeout must be between 5 and 300 seconds".to_owned(),
            ));
        }

        if self.heartbeat_secs > 600 {
            return Err(BusError::ConfigurationError(
                "heartbeat must be between 0 and 600 seconds".to_owned(),
            ));
        }

        if self.use_tls && self.port == 5672 {
            return Err(BusError::ConfigurationError(
                "tls is enabled but port is the non-tls port 5672, use 5671".to_owned(),
            ));
        }

        if self.use_tls
            && self
                .tls_server_name
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(BusError::ConfigurationError(
                "tls is enabled but tls_server_name is not specified".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Identity and consume-side behavior of this site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub site_name: String,
    pub max_concurrent_handlers: u32,
    pub process_broadcast_messages: bool,
    /// Skip exchange/queue provisioning and assume the infrastructure already
    /// exists. Used when the broker is managed by another service.
    pub skip_queue_setup: bool,
}

impl Default for SiteSettings {
    fn default() -> Self {
        SiteSettings {
            site_name: String::new(),
            max_concurrent_handlers: 10,
            process_broadcast_messages: true,
            skip_queue_setup: false,
        }
    }
}

impl SiteSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if Site::parse(&self.site_name).is_none() {
            return Err(BusError::ConfigurationError(format!(
                "invalid site name `{}`, must be one of: Hartsy, Hawtsy, DiscordBot",
                self.site_name
            )));
        }

        if !(1..=100).contains(&self.max_concurrent_handlers) {
            return Err(BusError::ConfigurationError(
                "max concurrent handlers must be between 1 and 100".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Shared queue limits and dead-letter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub default_message_ttl_ms: i32,
    pub max_queue_length: i32,
    pub max_priority: i32,
    pub dead_letter_ttl_ms: i32,
    pub durable_queues: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            default_message_ttl_ms: 24 * 60 * 60 * 1000,
            max_queue_length: 10_000,
            max_priority: 10,
            dead_letter_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            durable_queues: true,
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.default_message_ttl_ms <= 0 {
            return Err(BusError::ConfigurationError(
                "default message ttl must be positive".to_owned(),
            ));
        }

        if self.max_queue_length <= 0 {
            return Err(BusError::ConfigurationError(
                "max queue length must be positive".to_owned(),
            ));
        }

        if !(0..=255).contains(&self.max_priority) {
            return Err(BusError::ConfigurationError(
                "max priority must be between 0 and 255".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Overrides applied to the training events queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingQueueSettings {
    pub progress_message_ttl_ms: i32,
    pub max_training_queue_length: i32,
}

impl Default for TrainingQueueSettings {
    fn default() -> Self {
        TrainingQueueSettings {
            progress_message_ttl_ms: 6 * 60 * 60 * 1000,
            max_training_queue_length: 5000,
        }
    }
}

impl TrainingQueueSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.progress_message_ttl_ms <= 0 {
            return Err(BusError::ConfigurationError(
                "training progress message ttl must be positive".to_owned(),
            ));
        }

        if self.max_training_queue_length <= 0 {
            return Err(BusError::ConfigurationError(
                "training queue max length must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Redelivery policy hints exposed to handlers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u32,
    pub retry_multiplier: f64,
    pub max_retry_delay_ms: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retry_attempts: 3,
            initial_retry_delay_ms: 1000,
            retry_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.max_retry_attempts > 10 {
            return Err(BusError::ConfigurationError(
                "max retry attempts must be between 0 and 10".to_owned(),
            ));
        }

        if !(100..=60_000).contains(&self.initial_retry_delay_ms) {
            return Err(BusError::ConfigurationError(
                "initial retry delay must be between 100 and 60000 ms".to_owned(),
            ));
        }

        if !(1.0..=10.0).contains(&self.retry_multiplier) {
            return Err(BusError::ConfigurationError(
                "retry multiplier must be between 1.0 and 10.0".to_owned(),
            ));
        }

        if !(1000..=300_000).contains(&self.max_retry_delay_ms) {
            return Err(BusError::ConfigurationError(
                "max retry delay must be between 1000 and 300000 ms".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Metrics and health-probe intervals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enable_metrics: bool,
    pub enable_message_logging: bool,
    pub health_check_interval_secs: u64,
    pub statistics_interval_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        MonitoringSettings {
            enable_metrics: true,
            enable_message_logging: false,
            health_check_interval_secs: 30,
            statistics_interval_secs: 60,
        }
    }
}

impl MonitoringSettings {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.health_check_interval_secs == 0 {
            return Err(BusError::ConfigurationError(
                "health check interval must be positive".to_owned(),
            ));
        }

        if self.statistics_interval_secs == 0 {
            return Err(BusError::ConfigurationError(
                "statistics interval must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MessageBusConfig {
        let mut cfg = MessageBusConfig::default();
        cfg.site.site_name = "Hartsy".to_owned();
        cfg
    }

    #[test]
    fn default_config_with_known_site_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn unknown_site_name_is_rejected() {
        let mut cfg = valid_config();
        cfg.site.site_name = "SomewhereElse".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(BusError::ConfigurationError(_))
        ));
    }

    #[test]
    fn tls_on_default_port_is_rejected() {
        let mut cfg = valid_config();
        cfg.connection.use_tls = true;
        cfg.connection.tls_server_name = Some("broker.hartsy.ai".to_owned());
        assert!(cfg.validate().is_err());

        cfg.connection.port = 5671;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tls_requires_a_server_name() {
        let mut cfg = valid_config();
        cfg.connection.use_tls = true;
        cfg.connection.port = 5671;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_handler_concurrency_is_rejected() {
        let mut cfg = valid_config();
        cfg.site.max_concurrent_handlers = 0;
        assert!(cfg.validate().is_err());

        cfg.site.max_concurrent_handlers = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_queue_limits_are_rejected() {
        let mut cfg = valid_config();
        cfg.queues.default_message_ttl_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.training_queues.max_training_queue_length = -1;
        assert!(cfg.validate().is_err());
    }
}
