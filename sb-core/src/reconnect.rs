//! Per-connection reconnect bookkeeping on top of [`compute_backoff`].

use crate::backoff::{BackoffPolicy, compute_backoff};
use crate::error::SleepError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 12,
        }
    }
}

/// Attempt counter for one logical connection. Never shared between
/// connections; reset after every successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectManager {
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ReconnectManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            attempts: 0,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn increment(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Bumps the attempt counter and returns the delay for that attempt.
    pub fn next_delay(&mut self) -> Duration {
        let attempt = self.increment();
        compute_backoff(&self.policy.backoff, attempt)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep_with_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), SleepError> {
    if cancel.is_cancelled() {
        return Err(SleepError::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SleepError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconnectManager, ReconnectPolicy, sleep_with_cancel};
    use crate::backoff::BackoffPolicy;
    use crate::error::SleepError;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: BackoffPolicy {
                initial_ms: 100,
                max_ms: 1_000,
                factor: 2.0,
                jitter_fraction: 0.0,
            },
            max_attempts,
        }
    }

    #[test]
    fn exhausts_after_max_attempts_and_reset_restores() {
        let mut manager = ReconnectManager::new(policy(3));
        assert!(!manager.is_exhausted());
        assert_eq!(manager.increment(), 1);
        assert_eq!(manager.increment(), 2);
        assert!(!manager.is_exhausted());
        assert_eq!(manager.increment(), 3);
        assert!(manager.is_exhausted());

        manager.reset();
        assert!(!manager.is_exhausted());
        assert_eq!(manager.attempts(), 0);
    }

    #[test]
    fn next_delay_increments_before_computing() {
        let mut manager = ReconnectManager::new(policy(10));
        assert_eq!(manager.next_delay(), Duration::from_millis(100));
        assert_eq!(manager.attempts(), 1);
        assert_eq!(manager.next_delay(), Duration::from_millis(200));
        assert_eq!(manager.next_delay(), Duration::from_millis(400));
        assert_eq!(manager.attempts(), 3);
    }

    #[tokio::test]
    async fn sleep_rejects_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = sleep_with_cancel(Duration::from_secs(3600), &cancel).await;
        assert_eq!(outcome, Err(SleepError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_aborts_mid_wait_on_cancel() {
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sleep_with_cancel(Duration::from_secs(60), &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let outcome = waiter.await.expect("join sleeper");
        assert_eq!(outcome, Err(SleepError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        sleep_with_cancel(Duration::from_millis(500), &cancel)
            .await
            .expect("sleep completes");
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
