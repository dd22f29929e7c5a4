//! Bounded polling.
//!
//! Every bounded wait in deckhand (unit activation, port health) goes through
//! [`poll_until`]. Timing uses `tokio::time`, so tests can pause the clock and
//! let the runtime advance it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Interval and deadline for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total budget, measured from the first attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Create a retry policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why a polling loop gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The budget ran out before the probe succeeded.
    #[error("timed out after {elapsed:?} ({attempts} attempts)")]
    TimedOut {
        /// Attempts made.
        attempts: u32,
        /// Time spent.
        elapsed: Duration,
    },
    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

/// Run `probe` until it returns `true`, the budget is spent, or `cancel` fires.
///
/// The probe always runs at least once. A probe that returns after the
/// deadline does not get another attempt.
pub async fn poll_until<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<u32, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        attempts += 1;
        let ok = tokio::select! {
            ok = probe() => ok,
            () = cancel.cancelled() => return Err(PollError::Cancelled),
        };
        if ok {
            trace!(attempts, "poll succeeded");
            return Ok(attempts);
        }

        let now = Instant::now();
        if now + policy.interval > deadline {
            return Err(PollError::TimedOut {
                attempts,
                elapsed: now - started,
            });
        }

        tokio::select! {
            () = tokio::time::sleep(policy.interval) => {}
            () = cancel.cancelled() => return Err(PollError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_attempt() {
        let cancel = CancellationToken::new();
        let attempts = poll_until(policy(), &cancel, || async { true }).await;
        assert_eq!(attempts, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_probe_passes() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let started = Instant::now();
        let attempts = poll_until(policy(), &cancel, move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert_eq!(attempts, Ok(4));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let result = poll_until(policy(), &cancel, || async { false }).await;

        assert_eq!(
            result,
            Err(PollError::TimedOut {
                attempts: 11,
                elapsed: Duration::from_secs(10),
            })
        );
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = poll_until(policy(), &cancel, || async { false }).await;

        assert_eq!(result, Err(PollError::Cancelled));
        assert_eq!(started.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn already_cancelled_never_probes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = poll_until(policy(), &cancel, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
        .await;

        assert_eq!(result, Err(PollError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
