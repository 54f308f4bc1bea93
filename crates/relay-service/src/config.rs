//! Configuration for relay-service.

use std::path::PathBuf;
use std::time::Duration;

use saferet::SecretString;
use serviceconf::ServiceConf;
use svckit_core::config::{
    Backoff, BrokerConfig, CacheConfig, FailurePolicy, LogFileConfig, LogRotation,
    ObservabilityConfig, RetryPolicy,
};

const LOG_FILE_PREFIX: &str = "relay-service.log";

/// Configuration for relay-service.
#[derive(Debug, Clone, ServiceConf)]
pub struct Config {
    /// `RabbitMQ` host.
    #[conf(default = "localhost".to_string())]
    pub rabbitmq_host: String,

    /// `RabbitMQ` port.
    #[conf(default = 5672)]
    pub rabbitmq_port: u16,

    /// `RabbitMQ` user.
    #[conf(default = "guest".to_string())]
    pub rabbitmq_username: String,

    /// `RabbitMQ` password.
    #[conf(from_file)]
    pub rabbitmq_password: SecretString,

    /// `RabbitMQ` virtual host.
    #[conf(default = "/".to_string())]
    pub rabbitmq_vhost: String,

    /// Topic exchange messages are published to.
    #[conf(default = "svckit".to_string())]
    pub rabbitmq_exchange: String,

    /// Queue this service consumes.
    #[conf(default = "relay".to_string())]
    pub rabbitmq_queue: String,

    /// Comma-separated topics recorded from the queue.
    #[conf(default = "relay.message".to_string())]
    pub rabbitmq_topics: String,

    /// Unacknowledged deliveries per queue.
    #[conf(default = 10)]
    pub rabbitmq_prefetch: u16,

    /// `requeue` or `dead-letter`.
    #[conf(default = "requeue".to_string())]
    pub rabbitmq_failure_policy: String,

    /// Dead-letter exchange declared on the consumed queue (optional).
    pub rabbitmq_dead_letter_exchange: Option<String>,

    /// Secret for payload encryption (optional, at least 32 bytes).
    #[conf(from_file)]
    pub encryption_secret: Option<SecretString>,

    /// Additional publish attempts after the first.
    #[conf(default = 3)]
    pub publish_retries: u32,

    /// Delay between publish attempts in milliseconds.
    #[conf(default = 500)]
    pub publish_retry_delay_ms: u64,

    /// `fixed` or `linear`.
    #[conf(default = "fixed".to_string())]
    pub publish_backoff: String,

    /// Redis connection URL (optional). Enables last-message lookups.
    #[conf(from_file)]
    pub redis_url: Option<SecretString>,

    /// Prefix for every cache key.
    #[conf(default = "relay:".to_string())]
    pub cache_key_prefix: String,

    /// Lifetime of cached messages in seconds.
    #[conf(default = 3600)]
    pub cache_ttl_secs: u64,

    /// Received messages kept in memory for listing.
    #[conf(default = 1000)]
    pub message_buffer_size: usize,

    /// OTEL exporter endpoint (optional).
    #[conf(from_file)]
    pub otel_exporter_endpoint: Option<SecretString>,

    /// Verbose logging.
    #[conf(default = false)]
    pub debug: bool,

    /// JSON console logs.
    #[conf(default = false)]
    pub log_json: bool,

    /// Directory for rolling log files (optional).
    pub log_dir: Option<String>,

    /// `minutely`, `hourly`, `daily` or `never`.
    #[conf(default = "daily".to_string())]
    pub log_rotation: String,

    /// Server host address.
    #[conf(default = "0.0.0.0".to_string())]
    pub server_host: String,

    /// Server port.
    #[conf(default = 8080)]
    pub server_port: u16,

    /// Per-request timeout in seconds.
    #[conf(default = 30)]
    pub request_timeout_secs: u64,
}

impl Config {
    /// Returns the publish/connect retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error if `PUBLISH_BACKOFF` is not a known backoff.
    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        let backoff: Backoff = self.publish_backoff.parse()?;
        Ok(RetryPolicy::new(
            self.publish_retries,
            Duration::from_millis(self.publish_retry_delay_ms),
        )
        .with_backoff(backoff))
    }

    /// Returns the `RabbitMQ` configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a policy option cannot be parsed.
    pub fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        let failure_policy: FailurePolicy = self.rabbitmq_failure_policy.parse()?;
        Ok(BrokerConfig {
            host: self.rabbitmq_host.clone(),
            port: self.rabbitmq_port,
            username: self.rabbitmq_username.clone(),
            password: self.rabbitmq_password.clone(),
            vhost: self.rabbitmq_vhost.clone(),
            exchange: self.rabbitmq_exchange.clone(),
            encryption_secret: self.encryption_secret.clone(),
            prefetch: self.rabbitmq_prefetch,
            failure_policy,
            dead_letter_exchange: self.rabbitmq_dead_letter_exchange.clone(),
            retry: self.retry_policy()?,
            debug: self.debug,
        })
    }

    /// Topics registered on the consumed queue.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        split_topics(&self.rabbitmq_topics)
    }

    /// Returns the Redis configuration when a URL is set.
    #[must_use]
    pub fn cache_config(&self) -> Option<CacheConfig> {
        self.redis_url.as_ref().map(|url| CacheConfig {
            url: url.clone(),
            key_prefix: self.cache_key_prefix.clone(),
        })
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Returns the observability configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `LOG_ROTATION` is not a known rotation.
    pub fn observability_config(&self) -> anyhow::Result<ObservabilityConfig> {
        let rotation: LogRotation = self.log_rotation.parse()?;
        Ok(ObservabilityConfig {
            otlp_endpoint: self.otel_exporter_endpoint.clone(),
            debug: self.debug,
            json_logs: self.log_json,
            log_file: log_file(self.log_dir.as_deref(), rotation),
        })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the server address.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn log_file(dir: Option<&str>, rotation: LogRotation) -> Option<LogFileConfig> {
    dir.map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| LogFileConfig {
            dir: PathBuf::from(d),
            prefix: LOG_FILE_PREFIX.to_string(),
            rotation,
        })
}

fn split_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
