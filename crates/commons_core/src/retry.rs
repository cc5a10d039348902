/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::Duration;

use crate::error::QueryError;

/// Runs `op` until it succeeds or fails non-transiently, retrying transient
/// failures with exponential backoff. `attempts` is clamped to [1, 8].
pub async fn with_retry<T, F, Fut>(mut op: F, attempts: u32) -> Result<T, QueryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let max_attempts = attempts.clamp(1, 8);
    let mut backoff = Duration::from_millis(200);
    for attempt in 0..max_attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.is_transient() || attempt + 1 >= max_attempts {
                    return Err(e);
                }
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
    unreachable!("retry loop should return or error");
}

/// Backoff for the n-th reconnect attempt (1-based), capped and jittered.
pub fn next_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let mut ms = base_ms.saturating_mul(1u64 << pow);
    if ms > max_ms {
        ms = max_ms;
    }
    let jitter_ms: u64 = thread_rng().gen_range(0..=250);
    Duration::from_millis(ms) + Duration::from_millis(jitter_ms)
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(QueryError::Transient("down".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
        )
        .await;
        assert_eq!(out.expect("eventually succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts_surface_the_last_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), QueryError> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QueryError::Transient("still down".into())) }
            },
            3,
        )
        .await;
        assert!(matches!(out, Err(QueryError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_never_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), QueryError> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QueryError::NotFound("p1".into())) }
            },
            5,
        )
        .await;
        assert!(matches!(out, Err(QueryError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b1 = next_backoff(1, 500, 30_000);
        let b4 = next_backoff(4, 500, 30_000);
        let b20 = next_backoff(20, 500, 30_000);
        assert!(b1 >= Duration::from_millis(500));
        assert!(b4 >= Duration::from_millis(4_000));
        assert!(b20 <= Duration::from_millis(30_250));
    }
}
