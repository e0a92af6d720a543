//! Readiness polling with a fixed interval and bounded attempts

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::RetryPolicy;
use crate::{LxrError, Result};

/// Outcome of a single readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not ready yet; the string says what is still missing
    Pending(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Summary of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Number of probe evaluations, including the successful one
    pub polls: u32,
    pub elapsed: Duration,
}

/// Poll `condition` until it reports [`Readiness::Ready`]
///
/// The condition is evaluated at most `policy.max_attempts` times with
/// `policy.delay` between evaluations. A condition that never holds yields
/// [`LxrError::Timeout`] after `max_attempts × delay`, carrying the elapsed
/// time and the last pending status.
pub async fn wait_until_ready<F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    mut condition: F,
) -> Result<ProbeReport>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness>,
{
    let max_attempts = policy.attempts();
    let started = Instant::now();
    let mut last_status = String::from("not probed");

    for poll in 1..=max_attempts {
        match condition().await {
            Readiness::Ready => {
                let elapsed = started.elapsed();
                info!("{} ready after {} poll(s) ({:?})", target, poll, elapsed);
                return Ok(ProbeReport { polls: poll, elapsed });
            }
            Readiness::Pending(status) => {
                debug!("{} not ready ({}/{}): {}", target, poll, max_attempts, status);
                last_status = status;
            }
        }
        tokio::time::sleep(policy.delay).await;
    }

    Err(LxrError::Timeout {
        target: target.to_string(),
        attempts: max_attempts,
        elapsed: started.elapsed(),
        last_status,
    })
}
