//! The injectable clock collaborator (§6).
use std::time::Duration;

use time::OffsetDateTime;

/// Wall-clock access used by this crate, injectable so tests can run under
/// `#[tokio::test(start_paused = true)]` and drive virtual time with `tokio::time::advance`.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// The current wall-clock instant.
    fn now(&self) -> OffsetDateTime;

    /// Sleep for `duration`. Cancel-safe: dropping the future stops the sleep.
    async fn sleep(&self, duration: Duration);
}

/// The real clock, backed by `tokio::time`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
