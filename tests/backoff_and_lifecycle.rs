//! Property and unit tests that exercise pure logic without a live
//! database: the backoff formula and the status-DAG invariants from the
//! data model.

use proptest::prelude::*;
use systeric_pgqueue::{backoff_seconds, is_dead_letter, MessageStatus};

proptest! {
    /// Backoff: the instant difference between two successive
    /// `next_retry_at` values for the same message satisfies
    /// `t_k - t_{k-1} in [2^{k-1}s, 60s]`.
    #[test]
    fn backoff_stays_within_bounds(retry_count in 1i32..40) {
        let delay = backoff_seconds(retry_count);
        let expected = 2i64.saturating_pow((retry_count - 1) as u32).min(60);
        prop_assert_eq!(delay, expected);
        prop_assert!(delay >= 1);
        prop_assert!(delay <= 60);
    }

    #[test]
    fn backoff_is_monotonic_until_the_cap(retry_count in 1i32..10) {
        let current = backoff_seconds(retry_count);
        let next = backoff_seconds(retry_count + 1);
        prop_assert!(next >= current);
    }
}

#[test]
fn dead_letter_requires_retry_count_over_max() {
    let max_retries = 2;
    for retry_count in 0..=max_retries {
        assert!(!is_dead_letter(retry_count, max_retries));
    }
    assert!(is_dead_letter(max_retries + 1, max_retries));
}

#[test]
fn message_status_round_trips_through_serde() {
    let statuses = [
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Completed,
        MessageStatus::Failed,
        MessageStatus::DeadLetter,
    ];
    for status in statuses {
        let json = serde_json::to_string(&status).unwrap();
        let back: MessageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }
}
