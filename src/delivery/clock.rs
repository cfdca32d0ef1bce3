//! Time source for the delivery engine.
//!
//! Scheduling uses monotonic `tokio::time::Instant`s, so tests running
//! under a paused tokio clock see backoff complete instantly and
//! deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic and wall-clock time plus the ability to sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn utc_now(&self) -> DateTime<Utc>;

    async fn sleep_until(&self, deadline: Instant);

    /// Wall-clock equivalent of a monotonic instant.
    fn to_utc(&self, instant: Instant) -> DateTime<Utc> {
        let now = self.now();
        let utc = self.utc_now();
        if instant >= now {
            chrono::Duration::from_std(instant - now)
                .map(|d| utc + d)
                .unwrap_or(utc)
        } else {
            chrono::Duration::from_std(now - instant)
                .map(|d| utc - d)
                .unwrap_or(utc)
        }
    }
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}
