//! Dispatch and delivery configuration.

use core_config::{env_flag, env_or_default, env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;
use strum::{Display, EnumString};

/// Shape of the delay between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base * attempts`.
    Linear,
    /// `base * 2^(attempts - 1)`.
    Exponential,
}

/// Retry budget and backoff for transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has made `attempts` attempts may try again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt after `attempts` failed ones.
    ///
    /// Never zero, so a failing job cannot spin.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempts),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempts - 1)),
        };
        delay.min(self.max_delay).max(Duration::from_millis(1))
    }
}

/// Configuration for dispatching and delivering notifications.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Envelope and `From` address for every outbound message.
    pub sender: String,
    pub retry: RetryPolicy,
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Upper bound on a single transport send.
    pub send_timeout: Duration,
    /// How long a direct (user/email) dispatch waits for delivery.
    pub direct_send_wait: Duration,
    /// When set, elevated critical sends also ignore global unsubscribe.
    pub critical_bypasses_global_unsubscribe: bool,
}

impl DispatchConfig {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            retry: RetryPolicy::default(),
            worker_count: 4,
            send_timeout: Duration::from_secs(30),
            direct_send_wait: Duration::from_secs(10),
            critical_bypasses_global_unsubscribe: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, base_delay: Duration) -> Self {
        self.retry.strategy = strategy;
        self.retry.base_delay = base_delay;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_direct_send_wait(mut self, wait: Duration) -> Self {
        self.direct_send_wait = wait;
        self
    }

    pub fn with_critical_bypass(mut self, bypass: bool) -> Self {
        self.critical_bypasses_global_unsubscribe = bypass;
        self
    }
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let max_attempts: u32 = env_parse("NOTIFICATIONS_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::ParseError {
                key: "NOTIFICATIONS_MAX_ATTEMPTS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        let strategy_raw = env_or_default("NOTIFICATIONS_RETRY_STRATEGY", "linear");
        let strategy =
            strategy_raw
                .parse::<BackoffStrategy>()
                .map_err(|e| ConfigError::ParseError {
                    key: "NOTIFICATIONS_RETRY_STRATEGY".to_string(),
                    details: format!("{} ({})", e, strategy_raw),
                })?;

        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(env_parse("NOTIFICATIONS_RETRY_BACKOFF_MS", 1000)?),
            max_delay: Duration::from_millis(env_parse(
                "NOTIFICATIONS_RETRY_MAX_BACKOFF_MS",
                60_000,
            )?),
            strategy,
        };

        let worker_count: usize = env_parse("NOTIFICATIONS_WORKER_COUNT", 4)?;

        Ok(Self {
            sender: env_required("SENDER")?,
            retry,
            worker_count: worker_count.max(1),
            send_timeout: Duration::from_secs(env_parse("NOTIFICATIONS_SEND_TIMEOUT_SECS", 30)?),
            direct_send_wait: Duration::from_secs(env_parse(
                "NOTIFICATIONS_DIRECT_WAIT_SECS",
                10,
            )?),
            critical_bypasses_global_unsubscribe: env_flag(
                "NOTIFICATIONS_CRITICAL_BYPASS_GLOBAL_UNSUBSCRIBE",
                false,
            ),
        })
    }
}
