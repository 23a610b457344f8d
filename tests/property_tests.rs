use faultline::resilience::{BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use faultline::Fault;
use proptest::prelude::*;
use std::time::Duration;

fn strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
        Just(BackoffStrategy::ExponentialWithJitter),
    ]
}

proptest! {
    #[test]
    fn delays_never_exceed_max(
        strategy in strategy(),
        base in 0u64..5_000,
        extra in 0u64..60_000,
        multiplier in 1.0f64..4.0,
        jitter in any::<bool>(),
        attempt in 1u32..64,
    ) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_delay_ms: base + extra,
            backoff_multiplier: multiplier,
            jitter,
            strategy,
            ..RetryConfig::default()
        };
        let delay = config.delay_for_attempt(attempt);
        prop_assert!(delay <= Duration::from_millis(base + extra));
    }

    #[test]
    fn exponential_delays_are_monotonic(
        base in 1u64..2_000,
        multiplier in 1.0f64..3.0,
        max in 1u64..120_000,
    ) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_delay_ms: max.max(base),
            backoff_multiplier: multiplier,
            strategy: BackoffStrategy::Exponential,
            ..RetryConfig::default()
        };
        let delays: Vec<Duration> = (1..=12).map(|attempt| config.delay_for_attempt(attempt)).collect();
        prop_assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn breaker_counters_account_for_every_request(outcomes in prop::collection::vec(any::<bool>(), 1..60)) {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 600_000,
            ..CircuitBreakerConfig::named("property")
        });

        tokio_test::block_on(async {
            for succeed in &outcomes {
                let succeed = *succeed;
                let _ = breaker
                    .call(|| async move {
                        if succeed {
                            Ok(())
                        } else {
                            Err(Fault::network("flaky"))
                        }
                    })
                    .await;
            }
        });

        let metrics = tokio_test::block_on(breaker.metrics());
        prop_assert_eq!(metrics.total_requests, outcomes.len() as u64);
        prop_assert_eq!(
            metrics.total_requests,
            metrics.successful_requests + metrics.failed_requests + metrics.rejected_requests
        );
        prop_assert!(metrics.consecutive_failures == 0 || metrics.consecutive_successes == 0);
        prop_assert!(metrics.failed_requests >= metrics.state_transitions.len() as u64 * 3);
    }
}

#[test]
fn exponential_sequence_doubles_from_base() {
    let config = RetryConfig {
        base_delay_ms: 1000,
        max_delay_ms: 60_000,
        backoff_multiplier: 2.0,
        strategy: BackoffStrategy::Exponential,
        ..RetryConfig::default()
    };
    let delays: Vec<u64> = (1..=4)
        .map(|attempt| config.delay_for_attempt(attempt).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8]);
}
