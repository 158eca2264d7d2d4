//! Bounded polling for server-side state transitions.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{AdapterError, Result};

/// Cadence and deadline for waiting on the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before the first re-check.
    pub interval: Duration,
    /// Upper bound for the delay once backoff kicks in.
    pub max_interval: Duration,
    /// Total time allowed; `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(1),
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

impl PollPolicy {
    /// Repeatedly evaluate `check` until it yields `Some`.
    ///
    /// Errors from `check` abort the wait immediately. Between attempts the delay
    /// doubles, capped at `max_interval`. When the deadline would be exceeded a
    /// [`AdapterError::PollTimeout`] naming `what` is returned.
    pub async fn wait_for<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let mut delay = self.interval;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(value) = check().await? {
                return Ok(value);
            }

            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    return Err(AdapterError::PollTimeout {
                        what: what.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }

            tracing::debug!(what, attempt, ?delay, "still waiting");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2).min(self.max_interval.max(self.interval));
        }
    }
}
