use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::stats::StatsRegistry;
use crate::tracker::ConnectionTracker;

#[derive(Clone, Default)]
pub struct RunContext {
    pub tracker: Arc<ConnectionTracker>,
    pub stats: StatsRegistry,
    pub durations: Arc<AttemptDurations>,
    pub in_flight: Arc<InFlightAttempts>,
    pub shutdown: Arc<Shutdown>,
}

impl RunContext {
    pub fn new() -> Self {
        RunContext {
            tracker: Arc::new(ConnectionTracker::new()),
            stats: StatsRegistry::new(),
            durations: Arc::default(),
            in_flight: Arc::default(),
            shutdown: Arc::default(),
        }
    }
}

/// A latched shutdown signal. Waiters that arrive after the trigger return
/// at once.
#[derive(Default)]
pub struct Shutdown {
    fired: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Number of spawned connection attempts that have not finished yet.
#[derive(Default)]
pub struct InFlightAttempts {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightAttempts {
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct InFlightGuard(Arc<InFlightAttempts>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Default)]
struct DurationSums {
    total: (Duration, u32),
    success: (Duration, u32),
    failure: (Duration, u32),
}

/// Running means of how long connection attempts took.
#[derive(Default)]
pub struct AttemptDurations {
    sums: Mutex<DurationSums>,
}

impl AttemptDurations {
    pub fn record(&self, succeeded: bool, took: Duration) {
        let mut sums = self.sums.lock();
        let add = |slot: &mut (Duration, u32)| {
            slot.0 += took;
            slot.1 += 1;
        };
        add(&mut sums.total);
        if succeeded {
            add(&mut sums.success);
        } else {
            add(&mut sums.failure);
        }
    }

    /// Mean total, success and failure attempt time in milliseconds; 0 when
    /// nothing was recorded.
    pub fn mean_millis(&self) -> [f64; 3] {
        let sums = self.sums.lock();
        let mean = |(sum, count): (Duration, u32)| {
            if count == 0 {
                0.0
            } else {
                sum.as_nanos() as f64 / 1e6 / f64::from(count)
            }
        };
        [mean(sums.total), mean(sums.success), mean(sums.failure)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_is_latched() {
        let shutdown = Arc::new(Shutdown::default());
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        });
        tokio::task::yield_now().await;
        shutdown.trigger();
        waiter.await.unwrap();

        // late waiters do not block
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let in_flight = Arc::new(InFlightAttempts::default());
        in_flight.wait_idle().await;

        let first = in_flight.enter();
        let second = in_flight.enter();
        assert_eq!(in_flight.current(), 2);

        let waiter = tokio::spawn({
            let in_flight = in_flight.clone();
            async move { in_flight.wait_idle().await }
        });
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(second);
        waiter.await.unwrap();
        assert_eq!(in_flight.current(), 0);
    }

    #[test]
    fn test_attempt_duration_means() {
        let durations = AttemptDurations::default();
        assert_eq!(durations.mean_millis(), [0.0, 0.0, 0.0]);

        durations.record(true, Duration::from_millis(100));
        durations.record(true, Duration::from_millis(300));
        durations.record(false, Duration::from_millis(800));
        assert_eq!(durations.mean_millis(), [400.0, 200.0, 800.0]);
    }
}
