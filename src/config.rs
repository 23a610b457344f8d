//! Configuration file support
//!
//! A JSON document describing default and named breaker and retry settings:
//!
//! ```json
//! {
//!   "default_circuit_breaker": { "failure_threshold": 5, "recovery_timeout_ms": 60000 },
//!   "circuit_breakers": [ { "name": "stripe", "failure_threshold": 3 } ],
//!   "retry_handlers": { "s3-upload": { "max_attempts": 5, "strategy": "exponential" } },
//!   "recovery": { "history_limit": 500 }
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::resilience::{
    CircuitBreakerConfig, RetryConfig, DEFAULT_CACHE_CAPACITY, DEFAULT_HISTORY_LIMIT,
};

/// Settings for the error recovery system
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Recovery attempts kept for diagnostics
    pub history_limit: usize,
    /// Classifications cached before the oldest half is evicted
    pub classifier_cache_capacity: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            classifier_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Top-level resilience configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Template for breakers created on demand
    pub default_circuit_breaker: CircuitBreakerConfig,
    /// Template for retry handlers created on demand
    pub default_retry: RetryConfig,
    /// Breakers registered up front
    pub circuit_breakers: Vec<CircuitBreakerConfig>,
    /// Retry handlers registered up front, by name
    pub retry_handlers: HashMap<String, RetryConfig>,
    pub recovery: RecoverySettings,
}

impl ResilienceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ResilienceConfig =
            serde_json::from_str(json).context("Failed to parse resilience configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read resilience configuration {}", path.display()))?;
        Self::from_json_str(&json)
            .with_context(|| format!("Invalid resilience configuration in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.default_circuit_breaker
            .validate()
            .context("default_circuit_breaker")?;
        self.default_retry.validate().context("default_retry")?;

        let mut names = HashSet::new();
        for breaker in &self.circuit_breakers {
            breaker.validate()?;
            if !names.insert(breaker.name.as_str()) {
                bail!("circuit breaker '{}' is configured twice", breaker.name);
            }
        }
        for (name, retry) in &self.retry_handlers {
            retry
                .validate()
                .with_context(|| format!("retry handler '{}'", name))?;
        }
        if self.recovery.history_limit == 0 {
            bail!("recovery.history_limit must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffStrategy;

    #[test]
    fn parses_partial_documents_with_defaults() {
        let config = ResilienceConfig::from_json_str(
            r#"{
                "circuit_breakers": [{ "name": "stripe", "failure_threshold": 2 }],
                "retry_handlers": { "s3": { "max_attempts": 5, "strategy": "linear" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.circuit_breakers[0].failure_threshold, 2);
        assert_eq!(config.circuit_breakers[0].success_threshold, 3);
        assert_eq!(config.retry_handlers["s3"].strategy, BackoffStrategy::Linear);
        assert_eq!(config.recovery.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn rejects_duplicate_breakers() {
        let result = ResilienceConfig::from_json_str(
            r#"{ "circuit_breakers": [{ "name": "stripe" }, { "name": "stripe" }] }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_retry_settings() {
        let result = ResilienceConfig::from_json_str(
            r#"{ "retry_handlers": { "s3": { "max_attempts": 0 } } }"#,
        );
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("retry handler 's3'"));
    }
}
