//! Rate limiters throttle a stage's compute cadence.
//!
//! The runner only relies on [`RateLimiter::synchronize`] returning at most
//! once per target interval, best effort. Three strategies are provided:
//!
//! - [`FixedInterval`]: sleep one full interval every call.
//! - [`Deadline`]: wait until one interval after the previous return,
//!   sleeping for the bulk and spinning the last millisecond.
//! - [`VSync`]: keep a fixed schedule; when running behind, abstain from
//!   waiting and re-anchor the schedule on the current instant.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Blocking cadence control invoked once per compute cycle.
#[cfg_attr(test, mockall::automock)]
pub trait RateLimiter: Send {
    /// Block until the next cycle may start.
    fn synchronize(&mut self);

    /// Interval this limiter aims for.
    fn target_interval(&self) -> Duration;
}

/// Strategy selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateStrategy {
    Fixed,
    #[default]
    Deadline,
    #[serde(rename = "vsync")]
    VSync,
}

/// Build a limiter for `hz` cycles per second.
pub fn limiter_for(
    stage: &str,
    strategy: RateStrategy,
    hz: f64,
) -> PipelineResult<Box<dyn RateLimiter>> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(PipelineError::InvalidRate { stage: stage.to_string(), hz });
    }
    let interval = Duration::from_secs_f64(1.0 / hz);
    Ok(match strategy {
        RateStrategy::Fixed => Box::new(FixedInterval::new(interval)),
        RateStrategy::Deadline => Box::new(Deadline::new(interval)),
        RateStrategy::VSync => Box::new(VSync::new(interval)),
    })
}

/// Sleep until `deadline`; coarse sleep first, then spin for accuracy.
fn wait_until(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    let remaining = deadline - now;
    if remaining > Duration::from_millis(2) {
        std::thread::sleep(remaining - Duration::from_millis(1));
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Sleeps one full interval on every call.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RateLimiter for FixedInterval {
    fn synchronize(&mut self) {
        std::thread::sleep(self.interval);
    }

    fn target_interval(&self) -> Duration {
        self.interval
    }
}

/// Waits until one interval has passed since the previous return.
#[derive(Debug, Clone)]
pub struct Deadline {
    interval: Duration,
    last: Option<Instant>,
}

impl Deadline {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }
}

impl RateLimiter for Deadline {
    fn synchronize(&mut self) {
        if let Some(last) = self.last {
            wait_until(last + self.interval);
        }
        self.last = Some(Instant::now());
    }

    fn target_interval(&self) -> Duration {
        self.interval
    }
}

/// Fixed schedule that never tries to catch up.
#[derive(Debug, Clone)]
pub struct VSync {
    interval: Duration,
    next: Option<Instant>,
    abstained: u64,
}

impl VSync {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
            abstained: 0,
        }
    }

    /// Calls that returned immediately because the stage was behind.
    pub fn abstained(&self) -> u64 {
        self.abstained
    }
}

impl RateLimiter for VSync {
    fn synchronize(&mut self) {
        let now = Instant::now();
        match self.next {
            Some(next) if now < next => {
                wait_until(next);
                self.next = Some(next + self.interval);
            }
            Some(_) => {
                self.abstained += 1;
                self.next = Some(now + self.interval);
            }
            None => self.next = Some(now + self.interval),
        }
    }

    fn target_interval(&self) -> Duration {
        self.interval
    }
}
