use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;

/// Abstraction over the passage of time, so that retry loops and throttling delays can be
///  driven by something other than the wall clock in tests.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Tokio's clock. This honors paused time in tests (`start_paused`), which is usually all that
///  is needed for deterministic timing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
