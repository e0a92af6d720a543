//! Bounded retry-with-delay
//!
//! Every failure is treated as retryable up to the policy bound. The executor
//! never looks at *why* an attempt failed, so only idempotent operations may be
//! wrapped here: a half-applied attempt will simply be run again.

use std::fmt::Display;
use std::future::Future;
use tracing::{debug, warn};

use crate::types::RetryPolicy;

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed
///
/// Sleeps `policy.delay` between attempts (not after the last one). On
/// exhaustion the error of the *last* attempt is returned as-is.
///
/// # Usage
///
/// ```no_run
/// use lxr_core::{run_with_retry, LxrError, RetryPolicy};
///
/// async fn install() -> Result<(), LxrError> {
///     Ok(())
/// }
///
/// async fn example() -> Result<(), LxrError> {
///     run_with_retry("apt install", &RetryPolicy::PACKAGE_INSTALL, || install()).await
/// }
/// ```
pub async fn run_with_retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(val) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}/{}", operation_name, attempt, max_attempts);
                }
                return Ok(val);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation_name, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation_name, attempt, max_attempts, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LxrError;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let mut attempts = 0;
        let result = run_with_retry("test_op", &RetryPolicy::PACKAGE_INSTALL, || {
            attempts += 1;
            async move { Ok::<_, LxrError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_k_failures_uses_k_plus_one_calls() {
        let mut attempts = 0;
        let start = tokio::time::Instant::now();
        let result = run_with_retry("test_op", &RetryPolicy::PACKAGE_INSTALL, || {
            attempts += 1;
            let current = attempts;
            async move {
                if current <= 2 {
                    Err(LxrError::Other("transient".to_string()))
                } else {
                    Ok(current)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_not_first() {
        let mut attempts = 0;
        let result: Result<(), LxrError> =
            run_with_retry("test_op", &RetryPolicy::PACKAGE_INSTALL, || {
                attempts += 1;
                let current = attempts;
                async move { Err(LxrError::Other(format!("failure #{}", current))) }
            })
            .await;
        assert_eq!(attempts, 3);
        match result {
            Err(LxrError::Other(msg)) => assert_eq!(msg, "failure #3"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let mut attempts = 0;
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        let result: Result<(), String> = run_with_retry("test_op", &policy, || {
            attempts += 1;
            async move { Err("nope".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
