//! Recovery strategies
//!
//! Each strategy consumes a fault, its classification and the caller's
//! [`RecoveryContext`] and reports a [`RecoveryResult`]. Returning `Err` means the
//! strategy itself broke, which lets the recovery system move on to the next
//! recommended action.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::classifier::{ErrorCategory, ErrorClassification, ErrorSeverity, RecoveryAction};
use crate::error::Fault;

/// Context key holding a value produced by the fallback strategy
pub const FALLBACK_VALUE_KEY: &str = "fallback_value";
/// Context key holding a value produced by the degrade strategy
pub const DEGRADED_VALUE_KEY: &str = "degraded_value";

/// Outcome of running one recovery strategy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecoveryResult {
    pub success: bool,
    pub action_taken: RecoveryAction,
    pub message: String,
    pub duration: Duration,
    /// Caller should re-run the operation through a retry handler
    pub should_retry: bool,
    pub fallback_available: bool,
    /// Strategy-specific payload
    pub context: HashMap<String, Value>,
}

impl RecoveryResult {
    pub fn succeeded(action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success: true,
            action_taken: action,
            message: message.into(),
            duration: Duration::ZERO,
            should_retry: false,
            fallback_available: false,
            context: HashMap::new(),
        }
    }

    pub fn failed(action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::succeeded(action, message)
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Value substituted by a fallback or degraded mode, if any
    pub fn substitute_value(&self) -> Option<&Value> {
        self.context
            .get(FALLBACK_VALUE_KEY)
            .or_else(|| self.context.get(DEGRADED_VALUE_KEY))
    }
}

/// Zero-argument callable producing a substitute value
pub type SubstituteFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, Fault>> + Send + Sync>;

fn substitute_fn<F, Fut>(f: F) -> SubstituteFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Structured record handed to a notification sink
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub event_id: Uuid,
    pub fault_type: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub trace: Option<String>,
    pub context: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Receiver of fault notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Notification sink backed by a plain closure
pub struct CallbackSink<F>(F);

impl<F> CallbackSink<F>
where
    F: Fn(&NotificationEvent) -> Result<()> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

#[async_trait]
impl<F> NotificationSink for CallbackSink<F>
where
    F: Fn(&NotificationEvent) -> Result<()> + Send + Sync,
{
    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        (self.0)(event)
    }
}

/// Caller-supplied material the strategies draw on
#[derive(Clone, Default)]
pub struct RecoveryContext {
    /// Free-form values, copied into the classification
    pub values: HashMap<String, Value>,
    pub fallback_fn: Option<SubstituteFn>,
    pub fallback_value: Option<Value>,
    /// Degraded modes in order of preference
    pub degraded_modes: Vec<(String, SubstituteFn)>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub trace: Option<String>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_fallback_value(mut self, value: impl Into<Value>) -> Self {
        self.fallback_value = Some(value.into());
        self
    }

    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.fallback_fn = Some(substitute_fn(fallback));
        self
    }

    /// Append a degraded mode tried after the ones already present
    pub fn with_degraded_mode<F, Fut>(mut self, label: impl Into<String>, mode: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.degraded_modes.push((label.into(), substitute_fn(mode)));
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback_fn.is_some() || self.fallback_value.is_some()
    }
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modes: Vec<&str> = self.degraded_modes.iter().map(|(label, _)| label.as_str()).collect();
        f.debug_struct("RecoveryContext")
            .field("values", &self.values)
            .field("has_fallback_fn", &self.fallback_fn.is_some())
            .field("fallback_value", &self.fallback_value)
            .field("degraded_modes", &modes)
            .field("has_notifier", &self.notifier.is_some())
            .field("trace", &self.trace)
            .finish()
    }
}

/// A pluggable recovery strategy
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn execute(
        &self,
        fault: &Fault,
        classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, Fault>;
}

/// Recommends re-running the operation; never loops itself
#[derive(Debug, Default)]
pub struct RetryStrategy;

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    async fn execute(
        &self,
        _fault: &Fault,
        classification: &ErrorClassification,
        _context: &RecoveryContext,
    ) -> Result<RecoveryResult, Fault> {
        let retries = classification.recommended_retries.max(1);
        let backoff = classification.recommended_backoff_secs;
        let mut result = RecoveryResult::succeeded(
            RecoveryAction::Retry,
            format!("retry recommended: {} attempts, {:.1}s backoff", retries, backoff),
        )
        .with_context("max_retries", retries)
        .with_context("backoff_secs", backoff);
        result.should_retry = true;
        Ok(result)
    }
}

/// Substitutes a caller-supplied fallback function or value
#[derive(Debug, Default)]
pub struct FallbackStrategy;

#[async_trait]
impl RecoveryStrategy for FallbackStrategy {
    async fn execute(
        &self,
        _fault: &Fault,
        _classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, Fault> {
        let mut function_error = None;
        if let Some(fallback) = &context.fallback_fn {
            match fallback().await {
                Ok(value) => {
                    let mut result =
                        RecoveryResult::succeeded(RecoveryAction::Fallback, "fallback function succeeded")
                            .with_context(FALLBACK_VALUE_KEY, value)
                            .with_context("fallback_source", "function");
                    result.fallback_available = true;
                    return Ok(result);
                }
                Err(fault) => {
                    warn!("Fallback function failed: {}", fault);
                    function_error = Some(fault);
                }
            }
        }

        if let Some(value) = &context.fallback_value {
            let mut result = RecoveryResult::succeeded(RecoveryAction::Fallback, "using fallback value")
                .with_context(FALLBACK_VALUE_KEY, value.clone())
                .with_context("fallback_source", "value");
            result.fallback_available = true;
            return Ok(result);
        }

        // No usable fallback, so `fallback_available` stays false.
        Ok(match function_error {
            Some(fault) => RecoveryResult::failed(
                RecoveryAction::Fallback,
                format!("fallback function failed: {}", fault),
            ),
            None => RecoveryResult::failed(RecoveryAction::Fallback, "no fallback available"),
        })
    }
}

/// Tries each degraded mode in order until one succeeds
#[derive(Debug, Default)]
pub struct DegradeStrategy;

#[async_trait]
impl RecoveryStrategy for DegradeStrategy {
    async fn execute(
        &self,
        _fault: &Fault,
        _classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, Fault> {
        if context.degraded_modes.is_empty() {
            return Ok(RecoveryResult::failed(
                RecoveryAction::Degrade,
                "no degraded modes available",
            ));
        }

        let mut failures = Vec::new();
        for (label, mode) in &context.degraded_modes {
            match mode().await {
                Ok(value) => {
                    debug!("Degraded mode {} succeeded", label);
                    return Ok(RecoveryResult::succeeded(
                        RecoveryAction::Degrade,
                        format!("operating in degraded mode {}", label),
                    )
                    .with_context(DEGRADED_VALUE_KEY, value)
                    .with_context("degraded_mode", label.as_str()));
                }
                Err(fault) => {
                    debug!("Degraded mode {} failed: {}", label, fault);
                    failures.push(format!("{}: {}", label, fault));
                }
            }
        }

        Ok(RecoveryResult::failed(
            RecoveryAction::Degrade,
            format!("all degraded modes failed ({})", failures.join("; ")),
        ))
    }
}

/// Reports the fault to the caller's sink, or to the log when there is none
#[derive(Debug, Default)]
pub struct NotifyStrategy;

#[async_trait]
impl RecoveryStrategy for NotifyStrategy {
    async fn execute(
        &self,
        fault: &Fault,
        classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, Fault> {
        let event = NotificationEvent {
            event_id: Uuid::new_v4(),
            fault_type: fault.type_name().to_string(),
            message: fault.message().to_string(),
            category: classification.category,
            severity: classification.severity,
            trace: context.trace.clone(),
            context: classification.context.clone(),
            timestamp: Utc::now(),
        };

        let delivered = match &context.notifier {
            Some(sink) => match sink.notify(&event).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Notification sink failed for event {}: {:#}", event.event_id, e);
                    false
                }
            },
            None => {
                warn!(
                    "Fault notification {}: {} ({}, {:?}): {}",
                    event.event_id, event.fault_type, event.category, event.severity, event.message
                );
                false
            }
        };

        Ok(RecoveryResult::succeeded(RecoveryAction::Notify, "notification sent")
            .with_context("event_id", event.event_id.to_string())
            .with_context("delivered", delivered))
    }
}

/// Run a strategy and stamp the elapsed time on its result
pub(crate) async fn timed_execute(
    strategy: &dyn RecoveryStrategy,
    fault: &Fault,
    classification: &ErrorClassification,
    context: &RecoveryContext,
) -> Result<RecoveryResult, Fault> {
    let start = Instant::now();
    let mut result = strategy.execute(fault, classification, context).await?;
    result.duration = start.elapsed();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classifier::ErrorClassifier;

    fn classification_for(fault: &Fault) -> ErrorClassification {
        ErrorClassifier::new().classify(fault, &HashMap::new())
    }

    #[tokio::test]
    async fn fallback_function_preferred_over_value() {
        let fault = Fault::network("down");
        let context = RecoveryContext::new()
            .with_fallback(|| async { Ok(Value::from("computed")) })
            .with_fallback_value("static");

        let result = FallbackStrategy
            .execute(&fault, &classification_for(&fault), &context)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.substitute_value(), Some(&Value::from("computed")));
    }

    #[tokio::test]
    async fn failing_fallback_function_uses_value() {
        let fault = Fault::network("down");
        let context = RecoveryContext::new()
            .with_fallback(|| async { Err(Fault::network("cache also down")) })
            .with_fallback_value("static");

        let result = FallbackStrategy
            .execute(&fault, &classification_for(&fault), &context)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.substitute_value(), Some(&Value::from("static")));
    }

    #[tokio::test]
    async fn fallback_without_material_is_unavailable() {
        let fault = Fault::network("down");
        let result = FallbackStrategy
            .execute(&fault, &classification_for(&fault), &RecoveryContext::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.fallback_available);
    }

    #[tokio::test]
    async fn failing_fallback_function_without_value_is_unavailable() {
        let fault = Fault::network("down");
        let context =
            RecoveryContext::new().with_fallback(|| async { Err(Fault::network("cache also down")) });

        let result = FallbackStrategy
            .execute(&fault, &classification_for(&fault), &context)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.fallback_available);
        assert!(result.message.contains("cache also down"));
        assert!(result.substitute_value().is_none());
    }

    #[tokio::test]
    async fn degrade_tries_modes_in_order() {
        let fault = Fault::timeout("render slow");
        let context = RecoveryContext::new()
            .with_degraded_mode("cached", || async { Err(Fault::network("cache down")) })
            .with_degraded_mode("plain_text", || async { Ok(Value::from("plain")) })
            .with_degraded_mode("never", || async { Ok(Value::from("unused")) });

        let result = DegradeStrategy
            .execute(&fault, &classification_for(&fault), &context)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.context.get("degraded_mode"), Some(&Value::from("plain_text")));
        assert_eq!(result.substitute_value(), Some(&Value::from("plain")));
    }

    #[tokio::test]
    async fn notify_without_sink_still_succeeds() {
        let fault = Fault::permission_denied("bad key");
        let result = NotifyStrategy
            .execute(&fault, &classification_for(&fault), &RecoveryContext::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.context.get("delivered"), Some(&Value::from(false)));
    }

    #[tokio::test]
    async fn retry_strategy_signals_caller() {
        let fault = Fault::network("reset");
        let result = RetryStrategy
            .execute(&fault, &classification_for(&fault), &RecoveryContext::new())
            .await
            .unwrap();
        assert!(result.should_retry);
        assert_eq!(result.context.get("max_retries"), Some(&Value::from(3)));
    }
}
