//! Adaptive batch controller
//!
//! Decides how large the next burst is and how long to wait after it, based on
//! the session's success ratio. The collaborator never tells us it is under
//! pressure, the ratio of accepted units is the only signal we get, so the
//! controller speeds up under sustained success and backs off when success
//! degrades.
//!
//! # Policy
//! The ratio is classified against two thresholds:
//!
//! ```text
//! no data             -> Neutral   streak = 0
//! ratio > high        -> High      streak += 1
//! ratio < low         -> Low       streak = 0
//! otherwise           -> Held      streak = 0
//! ```
//!
//! and the decision is a pure function of `(ratio, streak)`:
//!
//! ```text
//! High && streak >= warmup:
//!     level = streak - warmup + 1
//!     batch = min(B0 + level * batch_step, max_batch_size)
//!     delay = max(D0 - level * delay_step, min_delay)
//! Low:
//!     batch = max(B0 / 2, min_batch_size)
//!     delay = min(D0 * 2, max_delay)
//! otherwise:
//!     (B0, D0)
//! ```
//!
//! Speed-up is monotonic in the streak and saturates at the configured bounds.
//! A session with no outcomes yet always starts from the defaults.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{error::Error, stats::StatsSnapshot};

/// Tuning knobs of the controller. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ControllerConfig {
    /// Burst size used when there is no reason to deviate.
    #[builder(default = 10)]
    pub batch_size: usize,
    /// Pause after each burst when there is no reason to deviate.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Ratios strictly above this count as high.
    #[builder(default = 0.4)]
    pub high_threshold: f64,
    /// Ratios strictly below this count as low.
    #[builder(default = 0.2)]
    pub low_threshold: f64,
    /// High bursts in a row needed before speeding up.
    #[builder(default = 5)]
    pub warmup_streak: u32,
    #[builder(default = 2)]
    pub batch_step: usize,
    #[builder(default = Duration::from_millis(10))]
    #[serde(with = "humantime_serde")]
    pub delay_step: Duration,
    #[builder(default = 50)]
    pub max_batch_size: usize,
    #[builder(default = 1)]
    pub min_batch_size: usize,
    #[builder(default = Duration::from_millis(10))]
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[builder(default = Duration::from_secs(2))]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How a ratio compares against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Nothing issued yet.
    Neutral,
    High,
    Low,
    Held,
}

/// Size of the next burst and the pause after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.low_threshold) || !in_unit(self.high_threshold) {
            return Err(Error::Config("thresholds must lie within [0, 1]".into()));
        }
        if self.low_threshold > self.high_threshold {
            return Err(Error::Config(format!(
                "low_threshold ({}) is above high_threshold ({})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.min_batch_size == 0 {
            return Err(Error::Config("min_batch_size must be at least 1".into()));
        }
        if !(self.min_batch_size..=self.max_batch_size).contains(&self.batch_size) {
            return Err(Error::Config(format!(
                "batch_size {} outside [{}, {}]",
                self.batch_size, self.min_batch_size, self.max_batch_size
            )));
        }
        if !(self.min_delay..=self.max_delay).contains(&self.delay) {
            return Err(Error::Config(format!(
                "delay {:?} outside [{:?}, {:?}]",
                self.delay, self.min_delay, self.max_delay
            )));
        }
        Ok(())
    }

    pub fn defaults(&self) -> Decision {
        Decision {
            batch_size: self.batch_size,
            delay: self.delay,
        }
    }

    pub fn classify(&self, ratio: Option<f64>) -> Signal {
        match ratio {
            None => Signal::Neutral,
            Some(r) if r > self.high_threshold => Signal::High,
            Some(r) if r < self.low_threshold => Signal::Low,
            Some(_) => Signal::Held,
        }
    }

    /// The streak after observing `ratio`.
    pub fn next_streak(&self, ratio: Option<f64>, streak: u32) -> u32 {
        match self.classify(ratio) {
            Signal::High => streak.saturating_add(1),
            _ => 0,
        }
    }

    /// Pure decision function. Same inputs, same answer.
    pub fn decide(&self, ratio: Option<f64>, streak: u32) -> Decision {
        match self.classify(ratio) {
            Signal::High if streak >= self.warmup_streak => {
                let level = streak.saturating_sub(self.warmup_streak).saturating_add(1);
                let batch_size = self
                    .batch_size
                    .saturating_add((level as usize).saturating_mul(self.batch_step))
                    .min(self.max_batch_size);
                let delay = self
                    .delay
                    .saturating_sub(self.delay_step.saturating_mul(level))
                    .max(self.min_delay);
                Decision { batch_size, delay }
            }
            Signal::Low => Decision {
                batch_size: (self.batch_size / 2).max(self.min_batch_size),
                delay: self.delay.saturating_mul(2).min(self.max_delay),
            },
            _ => self.defaults(),
        }
    }
}

/// Controller state for one run: the config plus the high-success streak.
#[derive(Debug, Clone)]
pub struct BatchController {
    config: ControllerConfig,
    streak: u32,
}

impl BatchController {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config, streak: 0 }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Fold the latest snapshot into the streak and decide the next burst.
    pub fn next(&mut self, snapshot: &StatsSnapshot) -> Decision {
        let ratio = snapshot.observed_ratio();
        self.streak = self.config.next_streak(ratio, self.streak);
        self.config.decide(ratio, self.streak)
    }
}
