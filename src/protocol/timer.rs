//! Periodic flush timer owned by the driver task.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Fires every flush interval while armed.
///
/// The first tick comes one full period after [`arm`](Self::arm). Ticks missed while
/// the driver was busy are skipped rather than delivered in a burst. A disarmed timer
/// never completes [`tick`](Self::tick), so it can sit in a `select!` unconditionally.
#[derive(Debug, Default)]
pub struct FlushTimer {
    interval: Option<Interval>,
    period: Option<Duration>,
}

impl FlushTimer {
    /// Disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) ticking every `period`.
    pub fn arm(&mut self, period: Duration) {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
        self.period = Some(period);
    }

    /// Stop ticking. No tick is observed after this returns.
    pub fn cancel(&mut self) {
        self.interval = None;
        self.period = None;
    }

    /// Whether ticks are being produced.
    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    /// Current period, `None` while disarmed.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Wait for the next tick. Pending forever while disarmed.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_period() {
        let mut timer = FlushTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_secs(60));

        let fired = timer.tick().await;
        assert_eq!(fired - start, Duration::from_secs(60));
        let fired = timer.tick().await;
        assert_eq!(fired - start, Duration::from_secs(120));
    }

    #[test]
    fn disarmed_tick_is_pending() {
        let mut timer = FlushTimer::new();
        let mut tick = tokio_test::task::spawn(timer.tick());
        tokio_test::assert_pending!(tick.poll());
        tokio_test::assert_pending!(tick.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut timer = FlushTimer::new();
        assert!(!timer.is_armed());
        let waited = time::timeout(Duration::from_secs(3600), timer.tick()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_ticks() {
        let mut timer = FlushTimer::new();
        timer.arm(Duration::from_secs(1));
        timer.tick().await;
        timer.cancel();
        assert!(!timer.is_armed());
        assert_eq!(timer.period(), None);
        let waited = time::timeout(Duration::from_secs(10), timer.tick()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ticks_are_skipped() {
        let mut timer = FlushTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_secs(1));

        // Busy for three and a half periods.
        time::advance(Duration::from_millis(3500)).await;
        let late = timer.tick().await;
        assert_eq!(late - start, Duration::from_secs(1));

        // The backlog is dropped: the next tick lands on the next period boundary.
        let next = timer.tick().await;
        assert_eq!(next - start, Duration::from_secs(4));
    }
}
