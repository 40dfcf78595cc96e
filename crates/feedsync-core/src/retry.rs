//! Bounded polling with doubling backoff.

use std::future::Future;

use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Result of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The check produced a value on attempt `attempts`
    Success { value: T, attempts: u32 },
    /// Every attempt came back empty
    GaveUp { attempts: u32 },
}

/// Run `check` until it yields `Some`, sleeping per `policy` between attempts.
///
/// The first attempt runs immediately; `check` receives the 1-based attempt
/// number.
pub async fn poll_until<T, F, Fut>(operation: &str, policy: &RetryPolicy, mut check: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if let Some(value) = check(attempt).await {
            return RetryOutcome::Success {
                value,
                attempts: attempt,
            };
        }

        if attempt < max_attempts {
            let delay = policy.delay_after(attempt);
            debug!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Nothing yet, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    warn!(operation, attempts = max_attempts, "Giving up after all retries");
    RetryOutcome::GaveUp {
        attempts: max_attempts,
    }
}
