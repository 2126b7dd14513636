//! Backoff and classification properties

use proptest::prelude::*;
use resilient_consumer::consumer::{ErrorKind, ProcessingError, RetryPolicy};
use rstest::rstest;
use std::time::Duration;

proptest! {
    #[test]
    fn backoff_is_monotonic_and_capped(
        max_retries in 1u32..50,
        initial_ms in 1u64..5_000,
        extra_ms in 0u64..60_000,
        multiplier in 1.0f64..10.0,
    ) {
        let max = Duration::from_millis(initial_ms + extra_ms);
        let policy = RetryPolicy::new(max_retries, Duration::from_millis(initial_ms), max, multiplier);

        for attempt in 1..=max_retries {
            let current = policy.delay(attempt);
            prop_assert!(current <= max);
            prop_assert!(current <= policy.delay(attempt + 1));
        }
    }

    #[test]
    fn first_retry_waits_initial_delay(initial_ms in 1u64..10_000, multiplier in 1.0f64..100.0) {
        let initial = Duration::from_millis(initial_ms);
        let policy = RetryPolicy::new(3, initial, Duration::from_secs(3600), multiplier);
        prop_assert_eq!(policy.delay(1), initial);
    }

    #[test]
    fn huge_attempts_saturate(attempt in 1_000u32..u32::MAX) {
        let policy = RetryPolicy::default();
        prop_assert_eq!(policy.delay(attempt), policy.max_backoff);
    }
}

#[rstest]
#[case::validation(ProcessingError::validation("recordId blank"), ErrorKind::Validation, false)]
#[case::permanent(ProcessingError::permanent("unknown homeworld"), ErrorKind::Permanent, false)]
#[case::transient(ProcessingError::transient("timeout"), ErrorKind::Transient, true)]
#[case::unclassified(ProcessingError::Other(anyhow::anyhow!("boom")), ErrorKind::Unclassified, true)]
fn test_error_classification(
    #[case] error: ProcessingError,
    #[case] kind: ErrorKind,
    #[case] retryable: bool,
) {
    assert_eq!(error.kind(), kind);
    assert_eq!(error.is_retryable(), retryable);
}

#[rstest]
#[case(1, Duration::from_millis(1000))]
#[case(2, Duration::from_millis(2000))]
#[case(3, Duration::from_millis(4000))]
#[case(4, Duration::from_millis(8000))]
#[case(5, Duration::from_millis(10_000))]
fn test_default_schedule(#[case] attempt: u32, #[case] expected: Duration) {
    assert_eq!(RetryPolicy::default().delay(attempt), expected);
}
