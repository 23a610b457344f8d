use anyhow::Result;
use faultline::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use faultline::{Fault, FaultKind, FaultSet, ResilienceError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        recovery_timeout_ms: 1000,
        call_timeout_ms: 500,
        ..CircuitBreakerConfig::named("test-service")
    })
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError> {
    breaker
        .call(|| async { Err::<(), _>(Fault::network("connection refused")) })
        .await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), ResilienceError> {
    breaker.call(|| async { Ok::<_, Fault>(()) }).await
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_basic_functionality() -> Result<()> {
    let breaker = breaker(3, 2);

    // Initially, circuit should be closed
    assert_eq!(breaker.state().await, CircuitState::Closed);

    // Record failures to open the circuit
    for _ in 0..3 {
        assert!(fail(&breaker).await.is_err());
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.can_execute().await);

    // Wait for the recovery timeout, then probe
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(breaker.can_execute().await);

    succeed(&breaker).await?;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    succeed(&breaker).await?;
    assert_eq!(breaker.state().await, CircuitState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_interleaved_success_resets_failure_count() {
    let breaker = breaker(3, 1);

    for _ in 0..2 {
        let _ = fail(&breaker).await;
    }
    succeed(&breaker).await.unwrap();
    for _ in 0..2 {
        let _ = fail(&breaker).await;
    }

    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.metrics().await.consecutive_failures, 2);

    let _ = fail(&breaker).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_until_recovery_timeout() {
    let breaker = breaker(1, 1);
    let invocations = Arc::new(AtomicU32::new(0));

    let _ = fail(&breaker).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Just short of the recovery timeout the call must not reach the operation
    tokio::time::sleep(Duration::from_millis(999)).await;
    let counter = invocations.clone();
    let err = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Fault>(())
        })
        .await
        .unwrap_err();

    match err {
        ResilienceError::CircuitOpen { name, retry_after } => {
            assert_eq!(name, "test-service");
            assert!(retry_after <= Duration::from_millis(1));
        }
        other => panic!("expected open circuit, got {other}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(breaker.metrics().await.rejected_requests, 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let counter = invocations.clone();
    breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Fault>(())
        })
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_single_failure_in_half_open_reopens() {
    let breaker = breaker(2, 3);

    for _ in 0..2 {
        let _ = fail(&breaker).await;
    }
    tokio::time::sleep(Duration::from_millis(1000)).await;

    succeed(&breaker).await.unwrap();
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    let _ = fail(&breaker).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    let states: Vec<(CircuitState, CircuitState)> = breaker
        .transitions()
        .await
        .into_iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        states,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
        ]
    );
    assert_eq!(breaker.metrics().await.recovery_attempts, 1);
}

#[tokio::test]
async fn test_uncounted_faults_pass_through() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        counted_faults: FaultSet::of([FaultKind::Network]),
        ..CircuitBreakerConfig::named("validation-service")
    });

    let err = breaker
        .call(|| async { Err::<(), _>(Fault::new(FaultKind::InvalidArgument, "bad sku")) })
        .await
        .unwrap_err();

    match err {
        ResilienceError::Fault(fault) => {
            assert_eq!(fault.kind(), &FaultKind::InvalidArgument);
            assert_eq!(fault.message(), "bad sku");
        }
        other => panic!("fault should propagate unchanged, got {other}"),
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.metrics().await.total_requests, 0);

    // A descendant of a counted kind still counts
    let _ = breaker
        .call(|| async { Err::<(), _>(Fault::new(FaultKind::ConnectionReset, "reset")) })
        .await;
    assert_eq!(breaker.state().await, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_counts_as_failure() {
    let breaker = breaker(1, 1);

    let err = breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Fault>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::CallTimeout { .. }));
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(breaker.metrics().await.failed_requests, 1);
}

#[tokio::test]
async fn test_reset_and_status() -> Result<()> {
    let breaker = breaker(2, 1);

    succeed(&breaker).await?;
    for _ in 0..2 {
        let _ = fail(&breaker).await;
    }
    let _ = succeed(&breaker).await;

    let status = breaker.status().await;
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.total_requests, 4);
    assert_eq!(status.successful_requests, 1);
    assert_eq!(status.failed_requests, 2);
    assert_eq!(status.rejected_requests, 1);
    assert!(!status.can_execute);
    assert!(status.last_failure_time.is_some());

    breaker.reset().await;
    let status = breaker.status().await;
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.consecutive_successes, 0);
    assert!(status.can_execute);

    // Counters survive a reset
    assert_eq!(status.total_requests, 4);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_do_not_serialize() -> Result<()> {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        call_timeout_ms: 5000,
        ..CircuitBreakerConfig::named("slow-service")
    });
    let slow_call = || async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, Fault>(())
    };

    let start = tokio::time::Instant::now();
    let (first, second, third) = tokio::join!(
        breaker.call(slow_call),
        breaker.call(slow_call),
        breaker.call(slow_call)
    );
    first?;
    second?;
    third?;

    // All three sleeps overlap
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    assert_eq!(breaker.metrics().await.successful_requests, 3);
    Ok(())
}
