//! Bounded retry combinator shared by every network call.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Add up to 50% random jitter on top of each delay.
    pub jitter: bool,
}

impl Backoff {
    /// Retry immediately.
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: false,
        }
    }

    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based): base * 2^(failures-1), capped.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(16);
        let mut delay = self.base.saturating_mul(1u32 << exponent).min(self.max);

        if self.jitter {
            let jitter_ms = delay.as_millis() as u64 / 2;
            if jitter_ms > 0 {
                delay += Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1));
            }
        }
        delay
    }
}

/// Attempt budget + backoff. The retryable-error predicate is supplied per call
/// so one policy can wrap calls with different error types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(250), Duration::from_secs(5)),
        }
    }
}

/// The last error of a retried operation together with how many attempts were made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.last, self.attempts)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails with an error `is_retryable` rejects,
    /// or the attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RetryError { attempts: attempt, last: e });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Fault {
        Transient,
        Permanent,
    }

    impl fmt::Display for Fault {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Backoff::none())
    }

    async fn flaky(calls: &AtomicU32, fail_first: u32) -> Result<&'static str, Fault> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_first {
            Err(Fault::Transient)
        } else {
            Ok("ok")
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let out = policy()
            .run("test", |_| flaky(&calls, 2), |e| *e == Fault::Transient)
            .await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("test", |_| flaky(&calls, 3), |e| *e == Fault::Transient)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, Fault::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Fault::Permanent) }
                },
                |e| *e == Fault::Transient,
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(300),
            jitter: false,
        };
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(300));
        assert_eq!(Backoff::none().delay_for(5), Duration::ZERO);
    }
}
