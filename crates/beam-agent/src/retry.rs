//! Whole-run retry loop
//!
//! Every failed run is restarted from the beginning after a fixed sleep.
//! Files the receiver already holds are skipped on the repeat.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Three hours of outage at one attempt per minute.
    pub const DEFAULT_ATTEMPTS: u32 = 180;
    pub const DEFAULT_INTERVAL_SECS: u64 = 60;

    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_ATTEMPTS,
            Duration::from_secs(Self::DEFAULT_INTERVAL_SECS),
        )
    }
}

/// Run `operation` until it succeeds or the attempt budget runs out.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "Beam run succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if attempt >= policy.attempts => {
                return Err(AgentError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                warn!(
                    attempt,
                    max_attempts = policy.attempts,
                    "Beam run failed, retrying in {:?}: {}",
                    policy.interval,
                    err
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(quick(5), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AgentError::Io(std::io::ErrorKind::ConnectionRefused.into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(quick(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AgentError::Io(std::io::ErrorKind::ConnectionReset.into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            AgentError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, AgentError::Io(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }

    #[test]
    fn test_default_covers_three_hours() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.interval * policy.attempts,
            Duration::from_secs(3 * 60 * 60)
        );
    }
}
