//! Poll-with-timeout helper shared by every verification wait.
//!
//! Built on `tokio::time`, so tests drive it with a paused clock instead of
//! real delays.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Retry interval and deadline of a verification wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// How a verification wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Calls `check` until it yields `Some`, the deadline passes, or `cancel`
/// fires.
///
/// `check` runs once immediately, then after every `interval`. The last
/// attempt happens at or just before the deadline.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + policy.timeout;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            result = check() => {
                if let Some(value) = result {
                    return PollOutcome::Ready(value);
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        let wait = policy.interval.min(deadline - now);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(500), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();

        let outcome = poll_until(policy(), &cancel, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                (n >= 3).then_some(n)
            }
        })
        .await;

        assert_eq!(outcome, PollOutcome::Ready(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome: PollOutcome<()> = poll_until(policy(), &cancel, || async { None }).await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1200)).await;
            trigger.cancel();
        });

        let outcome: PollOutcome<()> = poll_until(policy(), &cancel, || async { None }).await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_skips_check() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);

        let outcome: PollOutcome<()> = poll_until(policy(), &cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
