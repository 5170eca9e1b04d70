//! Rolling statistics for a session.
//!
//! [`StatAggregator`] is the single synchronized boundary every unit outcome
//! goes through. Counters live together behind one lock, so a reader can never
//! see `issued` bumped without the matching `succeeded`/`failed`.
//!
//! Throughput is not a lifetime average. A sampler calls
//! [`StatAggregator::sample`] on a fixed interval and the reported rate is the
//! delta of `issued` since the previous sample divided by the time between
//! them. That makes it reflect the current speed, which is what the adaptive
//! controller and a human watching `status` care about.
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::outcome::Outcome;

/// Raw counters. `succeeded + failed == issued` always holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl Counters {
    /// Incorporate a single outcome.
    pub fn consume(&mut self, outcome: &Outcome) {
        self.issued += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    /// `succeeded / issued`, or 0 when nothing was issued yet.
    pub fn success_ratio(&self) -> f64 {
        if self.issued == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.issued as f64
        }
    }
}

/// Immutable view of an aggregator at one point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_ratio: f64,
    pub throughput_per_second: f64,
    pub throughput_per_minute: f64,
}

impl StatsSnapshot {
    /// The success ratio, or `None` while there is no data to judge by.
    pub fn observed_ratio(&self) -> Option<f64> {
        (self.issued > 0).then_some(self.success_ratio)
    }
}

#[derive(Debug)]
struct Sample {
    at: Instant,
    issued: u64,
    per_second: f64,
}

#[derive(Debug)]
struct Inner {
    counters: Counters,
    sample: Sample,
}

impl Inner {
    fn fresh() -> Self {
        Self {
            counters: Counters::default(),
            sample: Sample {
                at: Instant::now(),
                issued: 0,
                per_second: 0.0,
            },
        }
    }
}

#[derive(Debug)]
pub struct StatAggregator {
    inner: Mutex<Inner>,
}

impl Default for StatAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::fresh()),
        }
    }

    // Counters stay consistent even if a holder panicked, every critical
    // section below is a handful of integer writes.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one outcome. `issued` and exactly one of `succeeded`/`failed`
    /// move together.
    pub fn record(&self, outcome: &Outcome) {
        self.lock().counters.consume(outcome);
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (counters, per_second) = {
            let inner = self.lock();
            (inner.counters, inner.sample.per_second)
        };
        StatsSnapshot {
            issued: counters.issued,
            succeeded: counters.succeeded,
            failed: counters.failed,
            success_ratio: counters.success_ratio(),
            throughput_per_second: per_second,
            throughput_per_minute: per_second * 60.0,
        }
    }

    /// Throughput tick: rate since the previous sample, then move the anchor.
    pub fn sample(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        let elapsed = now.duration_since(inner.sample.at);
        if elapsed.is_zero() {
            return;
        }
        let issued = inner.counters.issued;
        let delta = issued.saturating_sub(inner.sample.issued);
        inner.sample = Sample {
            at: now,
            issued,
            per_second: delta as f64 / elapsed.as_secs_f64(),
        };
    }

    /// Drop the reported rate to zero. Used once a run has drained.
    pub fn clear_rate(&self) {
        let mut inner = self.lock();
        inner.sample.per_second = 0.0;
    }

    pub fn reset(&self) {
        *self.lock() = Inner::fresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use std::time::Duration;

    #[test]
    fn empty_aggregator_reports_zero() {
        let stats = StatAggregator::new();
        let snap = stats.snapshot();

        assert_eq!(snap, StatsSnapshot::default());
        assert_eq!(snap.observed_ratio(), None);
    }

    #[test]
    fn errors_count_as_failures() {
        let stats = StatAggregator::new();
        stats.record(&Outcome::Success);
        stats.record(&Outcome::Failure);
        stats.record(&Outcome::Error(ExecutionError::Timeout(10)));

        let c = stats.counters();
        assert_eq!(c.issued, 3);
        assert_eq!(c.succeeded, 1);
        assert_eq!(c.failed, 2);
        assert!((stats.snapshot().success_ratio - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_balance_after_every_record() {
        let stats = StatAggregator::new();
        let outcomes = [Outcome::Success, Outcome::Failure, Outcome::Success];
        for (i, outcome) in outcomes.iter().cycle().take(100).enumerate() {
            stats.record(outcome);
            let c = stats.counters();
            assert_eq!(c.issued, i as u64 + 1);
            assert_eq!(c.succeeded + c.failed, c.issued);
            let ratio = stats.snapshot().success_ratio;
            assert!((0.0..=1.0).contains(&ratio));
        }
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let stats = StatAggregator::new();
        let threads = 8;
        let per_thread = 1_000;

        std::thread::scope(|s| {
            for t in 0..threads {
                let stats = &stats;
                s.spawn(move || {
                    for i in 0..per_thread {
                        let outcome = if (i + t) % 2 == 0 {
                            Outcome::Success
                        } else {
                            Outcome::Failure
                        };
                        stats.record(&outcome);
                    }
                });
            }
            // A reader racing the writers must never see an unbalanced view.
            s.spawn(|| {
                for _ in 0..1_000 {
                    let c = stats.counters();
                    assert_eq!(c.succeeded + c.failed, c.issued);
                }
            });
        });

        let c = stats.counters();
        assert_eq!(c.issued, (threads * per_thread) as u64);
        assert_eq!(c.succeeded + c.failed, c.issued);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_reports_recent_rate() {
        let stats = StatAggregator::new();
        for _ in 0..10 {
            stats.record(&Outcome::Success);
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        stats.sample();
        assert_eq!(stats.snapshot().throughput_per_second, 5.0);
        assert_eq!(stats.snapshot().throughput_per_minute, 300.0);

        // Nothing new in the next window: the rate drops instead of averaging.
        tokio::time::advance(Duration::from_secs(1)).await;
        stats.sample();
        assert_eq!(stats.snapshot().throughput_per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_everything() {
        let stats = StatAggregator::new();
        stats.record(&Outcome::Success);
        tokio::time::advance(Duration::from_secs(1)).await;
        stats.sample();

        stats.reset();

        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
