use anyhow::Result;
use faultline::resilience::testing::{run_breaker_trial, ChaosConfig, ChaosInjector};
use faultline::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RetryConfig,
    RetryHandler,
};
use faultline::{Fault, FaultKind};
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_breaker_trial_under_heavy_chaos() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 600_000,
        ..CircuitBreakerConfig::named("chaos-target")
    });
    let injector = ChaosInjector::new(ChaosConfig {
        failure_rate: 1.0,
        ..ChaosConfig::default()
    });

    let report = run_breaker_trial(&breaker, &injector, 20).await;

    assert_eq!(report.failures, 3);
    assert_eq!(report.rejected, 17);
    assert_eq!(report.successes, 0);
    assert_eq!(report.final_state, CircuitState::Open);
    assert_eq!(report.state_transitions, 1);
    assert_eq!(injector.injected(), 3);
}

#[tokio::test]
async fn test_breaker_trial_without_chaos_stays_closed() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::named("steady"));
    let injector = ChaosInjector::new(ChaosConfig {
        failure_rate: 0.0,
        ..ChaosConfig::default()
    });

    let report = run_breaker_trial(&breaker, &injector, 50).await;

    assert_eq!(report.successes, 50);
    assert_eq!(report.final_state, CircuitState::Closed);
    assert_eq!(injector.injected(), 0);
}

#[tokio::test]
async fn test_seeded_chaos_is_reproducible() {
    let run = |seed| async move {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1000,
            ..CircuitBreakerConfig::named("seeded")
        });
        let injector = ChaosInjector::new(ChaosConfig {
            failure_rate: 0.3,
            seed,
            ..ChaosConfig::default()
        });
        run_breaker_trial(&breaker, &injector, 200).await.failures
    };

    let first = run(7).await;
    assert_eq!(first, run(7).await);
    assert!(first > 0 && first < 200);
}

#[tokio::test(start_paused = true)]
async fn test_retry_rides_out_injected_faults() -> Result<()> {
    let injector = ChaosInjector::new(ChaosConfig {
        failure_rate: 0.5,
        fault_kind: FaultKind::ConnectionReset,
        seed: 3,
        ..ChaosConfig::default()
    });
    let handler = RetryHandler::new(
        "chaos-retry",
        RetryConfig {
            max_attempts: 20,
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..RetryConfig::default()
        },
    );

    let value = handler
        .execute_with_retry(|| injector.wrap(|| async { Ok::<_, Fault>("done") }))
        .await?;

    assert_eq!(value, "done");
    let metrics = handler.metrics().await;
    assert_eq!(metrics.total_attempts, injector.injected() + 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_callers_share_registry_breaker() -> Result<()> {
    let registry = CircuitBreakerRegistry::with_default_config(CircuitBreakerConfig {
        failure_threshold: 5,
        recovery_timeout_ms: 600_000,
        ..CircuitBreakerConfig::default()
    });
    let registry = Arc::new(registry);

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let registry = registry.clone();
        tasks.spawn(async move {
            let breaker = registry.get_or_create("shared", None).await;
            breaker
                .call(|| async { Err::<(), _>(Fault::network("down")) })
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        assert!(joined?.is_err());
    }

    let breaker = registry.get("shared").await.expect("breaker registered");
    let metrics = breaker.metrics().await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(metrics.total_requests, 10);
    assert_eq!(metrics.failed_requests + metrics.rejected_requests, 10);
    assert!(metrics.failed_requests >= 5);
    assert_eq!(registry.names().await.len(), 1);
    Ok(())
}
