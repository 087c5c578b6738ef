use std::cmp::min;
use std::future::Future;
use std::time::Duration;
use anyhow::bail;
use tokio_util::sync::CancellationToken;
use crate::clock::Clock;

/// How the per-attempt receive timeout evolves over consecutive timeouts
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Backoff {
    /// every attempt waits for the configured receive timeout
    Fixed,
    /// the timeout grows by `factor_eighths / 8` per consecutive timeout, capped at `max`
    Exponential {
        max: Duration,
        factor_eighths: u32,
    },
}

impl Backoff {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Backoff::Exponential { factor_eighths, .. } = self {
            if *factor_eighths < 8 {
                bail!("backoff factor of {}/8 would shrink the timeout", factor_eighths);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub backoff: Backoff,
    pub retry_limit: u32,
}

/// Tracks consecutive receive timeouts for a session. Any valid frame resets it.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    timeouts: u32,
    current_timeout: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> RetryState {
        RetryState {
            policy,
            timeouts: 0,
            current_timeout: policy.base_timeout,
        }
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// consecutive timeouts so far
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn reset(&mut self) {
        self.timeouts = 0;
        self.current_timeout = self.policy.base_timeout;
    }

    /// Registers a timeout and returns `false` once the retry limit is exceeded, i.e. the session
    ///  must fail.
    #[must_use]
    pub fn on_timeout(&mut self) -> bool {
        self.timeouts += 1;
        if let Backoff::Exponential { max, factor_eighths } = self.policy.backoff {
            self.current_timeout = min(self.current_timeout * factor_eighths / 8, max);
        }
        self.timeouts <= self.policy.retry_limit
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Waits for `fut` for at most `timeout` as measured by `clock`, giving up early if `cancel`
///  fires. Cancellation takes precedence when several things are ready at once.
pub async fn await_reply<F, T>(clock: &dyn Clock, cancel: &CancellationToken, timeout: Duration, fut: F) -> WaitOutcome<T>
where F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
        result = fut => WaitOutcome::Ready(result),
        _ = clock.sleep(timeout) => WaitOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use rstest::rstest;

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            base_timeout: Duration::from_millis(100),
            backoff,
            retry_limit: 3,
        }
    }

    #[test]
    fn test_retry_limit() {
        let mut state = RetryState::new(policy(Backoff::Fixed));
        assert!(state.on_timeout());
        assert!(state.on_timeout());
        assert!(state.on_timeout());
        assert!(!state.on_timeout());
        assert_eq!(state.timeouts(), 4);

        state.reset();
        assert_eq!(state.timeouts(), 0);
        assert!(state.on_timeout());
    }

    #[rstest]
    #[case::fixed(Backoff::Fixed, vec![100, 100, 100])]
    #[case::doubling(Backoff::Exponential { max: Duration::from_millis(1000), factor_eighths: 16 }, vec![200, 400, 800])]
    #[case::capped(Backoff::Exponential { max: Duration::from_millis(300), factor_eighths: 16 }, vec![200, 300, 300])]
    #[case::one_and_a_half(Backoff::Exponential { max: Duration::from_millis(1000), factor_eighths: 12 }, vec![150, 225, 337])]
    fn test_backoff(#[case] backoff: Backoff, #[case] expected_millis: Vec<u64>) {
        let mut state = RetryState::new(policy(backoff));
        assert_eq!(state.current_timeout(), Duration::from_millis(100));
        for expected in expected_millis {
            let _ = state.on_timeout();
            assert_eq!(state.current_timeout().as_millis() as u64, expected);
        }
        state.reset();
        assert_eq!(state.current_timeout(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_reply_ready() {
        let cancel = CancellationToken::new();
        let outcome = await_reply(&TokioClock, &cancel, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            17
        }).await;
        assert_eq!(outcome, WaitOutcome::Ready(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_reply_timeout() {
        let cancel = CancellationToken::new();
        let outcome = await_reply(&TokioClock, &cancel, Duration::from_secs(1), std::future::pending::<u32>()).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_reply_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = await_reply(&TokioClock, &cancel, Duration::from_secs(1), async { 1 }).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
