//! Resilience module
//!
//! This module provides the fault-tolerance patterns, including:
//! - Circuit breaker per dependency
//! - Retry with configurable backoff
//! - Error classification and pluggable recovery strategies
//! - Named registries and a manager composing all of the above

mod circuit_breaker;
mod classifier;
mod recovery;
mod registry;
mod retry;
mod strategies;
pub mod testing;

pub use circuit_breaker::{
    CircuitBreaker,
    CircuitBreakerConfig,
    CircuitBreakerMetrics,
    CircuitBreakerStatus,
    CircuitState,
    StateTransition,
};

pub use retry::{
    BackoffStrategy,
    RetryConfig,
    RetryHandler,
    RetryMetrics,
    RetryOutcome,
    RetryPredicate,
    RetryStatus,
};

pub use classifier::{
    ClassificationRule,
    ErrorCategory,
    ErrorClassification,
    ErrorClassifier,
    ErrorSeverity,
    RecoveryAction,
    DEFAULT_CACHE_CAPACITY,
};

pub use strategies::{
    CallbackSink,
    DegradeStrategy,
    FallbackStrategy,
    NotificationEvent,
    NotificationSink,
    NotifyStrategy,
    RecoveryContext,
    RecoveryResult,
    RecoveryStrategy,
    RetryStrategy,
    SubstituteFn,
    DEGRADED_VALUE_KEY,
    FALLBACK_VALUE_KEY,
};

pub use recovery::{
    ErrorRecoverySystem,
    RecoveryAttempt,
    RecoveryStatus,
    DEFAULT_HISTORY_LIMIT,
};

pub use registry::{
    CircuitBreakerRegistry,
    HealthLevel,
    RegistryHealth,
    RetryRegistry,
};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::config::ResilienceConfig;
use crate::error::{Fault, ResilienceError, ResilienceResult};

/// Aggregate health of every resilience component
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResilienceHealth {
    pub overall_health: HealthLevel,
    pub circuit_breakers: RegistryHealth<CircuitBreakerStatus>,
    pub retry_handlers: RegistryHealth<RetryStatus>,
    pub recovery: RecoveryStatus,
}

/// Resilience manager that coordinates all resilience patterns
pub struct ResilienceManager {
    circuit_breakers: CircuitBreakerRegistry,
    retry_handlers: RetryRegistry,
    recovery: Arc<ErrorRecoverySystem>,
}

impl ResilienceManager {
    /// Create a new resilience manager with default components
    pub fn new() -> Self {
        Self::with_components(
            CircuitBreakerRegistry::new(),
            RetryRegistry::new(),
            ErrorRecoverySystem::new(),
        )
    }

    pub fn with_components(
        circuit_breakers: CircuitBreakerRegistry,
        retry_handlers: RetryRegistry,
        recovery: ErrorRecoverySystem,
    ) -> Self {
        Self {
            circuit_breakers,
            retry_handlers,
            recovery: Arc::new(recovery),
        }
    }

    /// Build a manager with every configured breaker and handler pre-registered
    pub async fn from_config(config: &ResilienceConfig) -> Result<Self> {
        config.validate()?;

        let classifier =
            ErrorClassifier::new().with_cache_capacity(config.recovery.classifier_cache_capacity);
        let recovery = ErrorRecoverySystem::with_builtin_strategies(classifier)
            .with_history_limit(config.recovery.history_limit);

        let manager = Self::with_components(
            CircuitBreakerRegistry::with_default_config(config.default_circuit_breaker.clone()),
            RetryRegistry::with_default_config(config.default_retry.clone()),
            recovery,
        );

        for breaker in &config.circuit_breakers {
            manager
                .get_circuit_breaker(&breaker.name, Some(breaker.clone()))
                .await;
        }
        for (name, retry) in &config.retry_handlers {
            manager.get_retry_handler(name, Some(retry.clone())).await;
        }

        Ok(manager)
    }

    /// Get or create the circuit breaker for a dependency
    pub async fn get_circuit_breaker(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> CircuitBreaker {
        self.circuit_breakers.get_or_create(name, config).await
    }

    /// Get or create the retry handler for an operation
    pub async fn get_retry_handler(&self, name: &str, config: Option<RetryConfig>) -> RetryHandler {
        self.retry_handlers.get_or_create(name, config).await
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn retry_handlers(&self) -> &RetryRegistry {
        &self.retry_handlers
    }

    pub fn recovery(&self) -> &ErrorRecoverySystem {
        &self.recovery
    }

    /// Execute an operation with breaker, recovery and retry applied
    ///
    /// The operation runs once through the dependency's breaker. A failure is
    /// handed to the recovery system: a retry recommendation re-runs it through
    /// the dependency's retry handler (each attempt still passing the breaker),
    /// and a fallback or degraded value is deserialized into `T`.
    pub async fn execute<F, Fut, T>(
        &self,
        service_name: &str,
        operation: F,
        context: &RecoveryContext,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
        T: DeserializeOwned,
    {
        let breaker = self.get_circuit_breaker(service_name, None).await;
        let err = match breaker.call(&operation).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let fault = Fault::from(err.clone());
        let result = self.recovery.handle_error(&fault, context).await;

        if !result.success {
            // Open circuits and non-recoverable faults surface as themselves.
            if err.is_circuit_open() || !self.recovery.classify(&fault, context).is_recoverable {
                return Err(err);
            }
            return Err(ResilienceError::RecoveryFailed {
                message: result.message,
                fault,
            });
        }

        if result.should_retry {
            return self
                .retry_through_breaker(service_name, &breaker, &operation, &result, err)
                .await;
        }

        match result.substitute_value() {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ResilienceError::RecoveryFailed {
                    message: format!("{} value has an unexpected shape: {}", result.action_taken, e),
                    fault,
                }
            }),
            None => Err(ResilienceError::RecoveryFailed {
                message: format!(
                    "{} recovery produced no result: {}",
                    result.action_taken, result.message
                ),
                fault,
            }),
        }
    }

    async fn retry_through_breaker<F, Fut, T>(
        &self,
        service_name: &str,
        breaker: &CircuitBreaker,
        operation: &F,
        recommendation: &RecoveryResult,
        first_error: ResilienceError,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let handler = match self.retry_handlers.get(service_name).await {
            Some(handler) => handler,
            None => {
                let hinted = hinted_retry_config(recommendation);
                self.retry_handlers
                    .get_or_create(service_name, Some(hinted))
                    .await
            }
        };

        let first_fault = Fault::from(first_error.clone());
        if !handler.is_retryable(&first_fault) {
            debug!(
                "Not retrying {}: {} is not retryable",
                service_name,
                first_fault.type_name()
            );
            return Err(first_error);
        }

        // The failed breaker call counts as the attempt before the first retry.
        let delay = handler.calculate_delay(1);
        debug!(
            "Retrying {} in {}ms through handler with {} attempts",
            service_name,
            delay.as_millis(),
            handler.config().max_attempts
        );
        tokio::time::sleep(delay).await;

        handler
            .execute_with_retry(move || async move { breaker.call(operation).await.map_err(Fault::from) })
            .await
            .map_err(|err| match err {
                ResilienceError::Fault(fault) => fault.into_resilience_error(),
                other => other,
            })
    }

    /// Health of all registered breakers and handlers plus recovery statistics
    pub async fn health_report(&self) -> ResilienceHealth {
        let circuit_breakers = self.circuit_breakers.health().await;
        let retry_handlers = self.retry_handlers.health().await;
        ResilienceHealth {
            overall_health: circuit_breakers
                .overall_health
                .worst(retry_handlers.overall_health),
            circuit_breakers,
            retry_handlers,
            recovery: self.recovery.status().await,
        }
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry configuration derived from a retry recommendation
fn hinted_retry_config(recommendation: &RecoveryResult) -> RetryConfig {
    let defaults = RetryConfig::default();
    let max_attempts = recommendation
        .context
        .get("max_retries")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(defaults.max_attempts);
    let base_delay_ms = recommendation
        .context
        .get("backoff_secs")
        .and_then(Value::as_f64)
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(defaults.base_delay_ms);

    RetryConfig {
        max_attempts: max_attempts.max(1),
        base_delay_ms,
        max_delay_ms: defaults.max_delay_ms.max(base_delay_ms),
        ..defaults
    }
}
