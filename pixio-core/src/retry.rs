//! Bounded retry loops with exponential backoff

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Exponential backoff calculator.
///
/// No jitter: retry schedules here are fixed (document writes back off at
/// `200ms * 2^attempt`, single uploads at `300ms * 2^(attempt-1)`).
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff starting at `base_ms` with a cap of `max_ms`.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    /// Get the next delay duration and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64.wrapping_shl(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(exp.min(self.max_ms))
    }

    /// Reset the backoff (e.g., after a successful attempt).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// One attempt's verdict inside [`run_bounded`].
pub enum Attempt<T> {
    /// The operation finished; stop retrying.
    Done(T),
    /// Transient outcome; back off and try again.
    Retry,
}

/// Drive `op` up to `max_attempts` times, sleeping `backoff.next_delay()`
/// between attempts. Returns `Ok(None)` when every attempt asked to retry.
///
/// The closure receives the 1-based attempt number. Errors abort the loop
/// immediately; only an explicit `Attempt::Retry` continues it.
pub async fn run_bounded<T, F, Fut>(
    max_attempts: u32,
    mut backoff: Backoff,
    mut op: F,
) -> Result<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    for attempt in 1..=max_attempts {
        match op(attempt).await? {
            Attempt::Done(value) => return Ok(Some(value)),
            Attempt::Retry => {
                if attempt < max_attempts {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = Backoff::new(100, 10_000);

        assert_eq!(backoff.next_delay().as_millis(), 100);
        assert_eq!(backoff.next_delay().as_millis(), 200);
        assert_eq!(backoff.next_delay().as_millis(), 400);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = Backoff::new(100, 500);

        for _ in 0..20 {
            assert!(backoff.next_delay().as_millis() <= 500);
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(100, 10_000);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.next_delay().as_millis(), 100);
    }

    #[tokio::test]
    async fn test_run_bounded_succeeds_mid_loop() {
        let result = run_bounded(5, Backoff::new(1, 10), |attempt| async move {
            if attempt < 3 {
                Ok(Attempt::Retry)
            } else {
                Ok(Attempt::Done(attempt))
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn test_run_bounded_exhausts() {
        let result: Option<()> = run_bounded(3, Backoff::new(1, 10), |_| async {
            Ok(Attempt::Retry)
        })
        .await
        .unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_run_bounded_error_aborts() {
        let mut calls = 0u32;
        let result: crate::error::Result<Option<()>> = run_bounded(
            5,
            Backoff::new(1, 10),
            |_| {
                calls += 1;
                async move { Err(crate::error::PixError::Internal("boom".to_string())) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
