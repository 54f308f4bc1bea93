//! Shared configuration types for all svckit components.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use saferet::SecretString;

use crate::{Error, crypto::MIN_SECRET_LEN};

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// `delay * n` before the n-th retry.
    Linear,
}

impl FromStr for Backoff {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            other => Err(Error::Configuration(format!(
                "unknown backoff '{other}', expected 'fixed' or 'linear'"
            ))),
        }
    }
}

/// Bounded retry policy shared by publishing and connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(retry.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Negatively acknowledge and ask the broker to redeliver.
    #[default]
    Requeue,
    /// Negatively acknowledge without requeue so the queue's dead-letter
    /// exchange, if any, receives the message.
    DeadLetter,
}

impl FailurePolicy {
    #[must_use]
    pub fn requeue(self) -> bool {
        matches!(self, Self::Requeue)
    }
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "requeue" => Ok(Self::Requeue),
            "dead-letter" | "deadletter" => Ok(Self::DeadLetter),
            other => Err(Error::Configuration(format!(
                "unknown failure policy '{other}', expected 'requeue' or 'dead-letter'"
            ))),
        }
    }
}

/// `RabbitMQ` configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub vhost: String,
    /// Topic exchange every message is published to.
    pub exchange: String,
    /// Enables payload encryption when set.
    pub encryption_secret: Option<SecretString>,
    /// Unacknowledged deliveries the broker may push per queue.
    pub prefetch: u16,
    pub failure_policy: FailurePolicy,
    /// Declared as `x-dead-letter-exchange` on consumed queues.
    pub dead_letter_exchange: Option<String>,
    /// Default policy for publishing and connecting.
    pub retry: RetryPolicy,
    pub debug: bool,
}

impl BrokerConfig {
    /// Checks the options eagerly so bad configuration fails at startup.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` describing the first invalid option.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("broker host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("broker port must not be 0".into()));
        }
        if self.exchange.trim().is_empty() {
            return Err(Error::Configuration(
                "broker exchange must not be empty".into(),
            ));
        }
        if self.prefetch == 0 {
            return Err(Error::Configuration("prefetch must be at least 1".into()));
        }
        if let Some(secret) = &self.encryption_secret
            && secret.expose().len() < MIN_SECRET_LEN
        {
            return Err(Error::Configuration(format!(
                "encryption secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Redis configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub url: SecretString,
    /// Prepended to every key, e.g. `"relay:"`.
    pub key_prefix: String,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    /// A single file that is never rotated.
    Never,
}

impl FromStr for LogRotation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minutely" => Ok(Self::Minutely),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            other => Err(Error::Configuration(format!(
                "unknown log rotation '{other}', expected 'minutely', 'hourly', 'daily' or 'never'"
            ))),
        }
    }
}

/// Log file output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileConfig {
    pub dir: PathBuf,
    /// File name prefix, e.g. `"relay-service.log"`.
    pub prefix: String,
    pub rotation: LogRotation,
}

/// Observability configuration.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub otlp_endpoint: Option<SecretString>,
    /// Lowers the default log level to `debug`.
    pub debug: bool,
    /// Emit console logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
    /// Also write JSON logs to rolling files when set.
    pub log_file: Option<LogFileConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_waits_the_same_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn linear_backoff_grows_by_the_base_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200)).with_backoff(Backoff::Linear);
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(600));
    }

    #[test]
    fn policies_parse_from_strings() {
        assert_eq!("Linear".parse::<Backoff>().ok(), Some(Backoff::Linear));
        assert!("exponential".parse::<Backoff>().is_err());
        assert_eq!(
            "dead_letter".parse::<FailurePolicy>().ok(),
            Some(FailurePolicy::DeadLetter)
        );
        assert!(!FailurePolicy::DeadLetter.requeue());
        assert!(FailurePolicy::Requeue.requeue());
    }

    #[test]
    fn log_rotation_parses_from_strings() {
        assert_eq!("HOURLY".parse::<LogRotation>().ok(), Some(LogRotation::Hourly));
        assert_eq!(" never ".parse::<LogRotation>().ok(), Some(LogRotation::Never));
        assert_eq!(LogRotation::default(), LogRotation::Daily);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    fn secret(raw: &str) -> SecretString {
        raw.parse().ok().expect("secret from string")
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "localhost".into(),
            port: 5672,
            username: "guest".into(),
            password: secret("guest"),
            vhost: "/".into(),
            exchange: "svckit".into(),
            encryption_secret: None,
            prefetch: 10,
            failure_policy: FailurePolicy::default(),
            dead_letter_exchange: None,
            retry: RetryPolicy::default(),
            debug: false,
        }
    }

    #[test]
    fn validate_rejects_short_secret_and_zero_prefetch() {
        assert!(broker_config().validate().is_ok());

        let mut config = broker_config();
        config.encryption_secret = Some(secret("too-short"));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = broker_config();
        config.prefetch = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
