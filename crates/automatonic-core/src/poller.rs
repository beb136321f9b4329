//! Retry-with-timeout polling of remote-observable conditions.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::CommandError;

/// Interval and budget for a condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptions {
    /// Delay between attempts.
    pub interval: Duration,
    /// Wall-clock budget measured from the first attempt.
    pub timeout: Duration,
}

impl PollOptions {
    /// Create poll options.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Evaluate `check` until it reports `true` or `options.timeout` elapses.
///
/// A `false` result schedules another attempt after `options.interval` (never
/// sleeping past the deadline). An error from `check` is returned at once:
/// a failed evaluation is not a condition that has yet to hold.
///
/// # Errors
/// Returns [`CommandError::Timeout`] naming `what` when the budget runs out,
/// or the first error produced by `check`.
pub async fn wait_until<F, Fut>(
    what: &str,
    options: PollOptions,
    mut check: F,
) -> Result<bool, CommandError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, CommandError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if check().await? {
            tracing::debug!(what, attempts, "condition met");
            return Ok(true);
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            tracing::warn!(
                what,
                attempts,
                elapsed_ms = elapsed.as_millis(),
                "condition wait timed out"
            );
            return Err(CommandError::Timeout {
                what: what.to_string(),
                budget: options.timeout,
                elapsed,
            });
        }

        let remaining = options.timeout.saturating_sub(elapsed);
        tokio::time::sleep(options.interval.min(remaining)).await;
    }
}
