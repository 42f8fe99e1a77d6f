//! Deduction configuration, loaded from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `STOCK_DEDUCTION_STRATEGY` | required (`conditional` / `pessimistic`) |
//! | `STOCK_RETRY_MAX_ATTEMPTS` | 5 |
//! | `STOCK_RETRY_BASE_DELAY_MS` | 20 |
//! | `STOCK_RETRY_MAX_DELAY_MS` | 1000 |
//! | `STOCK_RETRY_JITTER` | 0.2 |
//! | `STOCK_LOCK_TIMEOUT_MS` | 2000 |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::strategy::StrategyKind;

pub const ENV_STRATEGY: &str = "STOCK_DEDUCTION_STRATEGY";
pub const ENV_MAX_ATTEMPTS: &str = "STOCK_RETRY_MAX_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "STOCK_RETRY_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "STOCK_RETRY_MAX_DELAY_MS";
pub const ENV_JITTER: &str = "STOCK_RETRY_JITTER";
pub const ENV_LOCK_TIMEOUT_MS: &str = "STOCK_LOCK_TIMEOUT_MS";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Everything a [`DeductionService`](crate::service::DeductionService) needs
/// besides the store.
///
/// There is no `Default`: which strategy runs is always an explicit choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockConfig {
    pub strategy: StrategyKind,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Duration,
}

fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

impl StockConfig {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            retry: RetryPolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source; `lookup` returns `None` for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let strategy = lookup(ENV_STRATEGY)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_STRATEGY))?
            .parse::<StrategyKind>()
            .map_err(|e| ConfigError::invalid(ENV_STRATEGY, e))?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, ENV_MAX_ATTEMPTS, defaults.max_attempts)?,
            base_delay: millis_or(&lookup, ENV_BASE_DELAY_MS, defaults.base_delay)?,
            max_delay: millis_or(&lookup, ENV_MAX_DELAY_MS, defaults.max_delay)?,
            strategy: BackoffStrategy::Exponential,
            jitter: parse_or(&lookup, ENV_JITTER, defaults.jitter)?,
        };
        let lock_timeout = millis_or(&lookup, ENV_LOCK_TIMEOUT_MS, DEFAULT_LOCK_TIMEOUT)?;

        let config = Self {
            strategy,
            retry,
            lock_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(ENV_MAX_ATTEMPTS, "must be at least 1"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::invalid(
                ENV_MAX_DELAY_MS,
                "must not be smaller than the base delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid(ENV_JITTER, "must be within 0.0..=1.0"));
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::invalid(
                ENV_LOCK_TIMEOUT_MS,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{raw}': {e}"))),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn strategy_is_required() {
        let err = StockConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_STRATEGY));

        let err = StockConfig::from_lookup(lookup(&[(ENV_STRATEGY, "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_STRATEGY));
    }

    #[test]
    fn defaults_apply_when_only_strategy_is_set() {
        let config = StockConfig::from_lookup(lookup(&[(ENV_STRATEGY, "pessimistic")])).unwrap();

        assert_eq!(config, StockConfig::new(StrategyKind::PessimisticLock));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
    }

    #[test]
    fn overrides_are_read() {
        let config = StockConfig::from_lookup(lookup(&[
            (ENV_STRATEGY, "conditional"),
            (ENV_MAX_ATTEMPTS, "8"),
            (ENV_BASE_DELAY_MS, "5"),
            (ENV_MAX_DELAY_MS, "250"),
            (ENV_JITTER, "0"),
            (ENV_LOCK_TIMEOUT_MS, "750"),
        ]))
        .unwrap();

        assert_eq!(config.strategy, StrategyKind::ConditionalUpdate);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.base_delay, Duration::from_millis(5));
        assert_eq!(config.retry.max_delay, Duration::from_millis(250));
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.lock_timeout, Duration::from_millis(750));
    }

    #[test]
    fn bad_values_are_rejected() {
        let cases = [
            (ENV_STRATEGY, "optimistic"),
            (ENV_MAX_ATTEMPTS, "0"),
            (ENV_MAX_ATTEMPTS, "many"),
            (ENV_JITTER, "1.5"),
            (ENV_LOCK_TIMEOUT_MS, "0"),
            (ENV_MAX_DELAY_MS, "1"),
        ];

        for (key, value) in cases {
            let mut pairs = vec![(ENV_STRATEGY, "conditional")];
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, value));

            let err = StockConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}={value} gave {err:?}"
            );
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: StockConfig =
            serde_json::from_value(serde_json::json!({ "strategy": "conditional" })).unwrap();
        assert_eq!(config, StockConfig::new(StrategyKind::ConditionalUpdate));
    }
}
