//! Stage instrumentation.
//!
//! The runner measures each cycle and hands a [`CycleReport`] to every
//! registered [`StageObserver`]; presentation lives in the observers, never
//! in the scheduler. Aggregates are kept in a [`MetricsRegistry`] so
//! monitoring surfaces (the status line, the run summary) can snapshot any
//! stage at any time.

use crate::pipeline::binding::Freshness;
use crate::pipeline::runner::RunState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default smoothing factor for moving averages.
pub const DEFAULT_EMA_ALPHA: f64 = 0.1;

/// Minimum spacing between stall warnings for one stage.
const STALL_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential moving average over durations.
#[derive(Debug, Clone, Copy)]
pub struct MovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl MovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64() * 1e6;
        self.value = Some(match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        });
    }

    /// Current average in microseconds (0 before any sample).
    pub fn micros(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_ALPHA)
    }
}

/// Phases of one compute cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Assimilate,
    RateWait,
    Compute,
    Publish,
    Release,
}

/// Measurements for one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    /// False when the aggregate input timeout elapsed before all inputs.
    pub punctual: bool,
    pub published: bool,
    pub assimilation: Duration,
    pub rate_wait: Duration,
    pub compute: Duration,
    pub iteration: Duration,
    /// Provenance of each input, in binding order. `None` for an input that
    /// was still being assimilated when the cycle went ahead.
    pub inputs: Vec<Option<Freshness>>,
}

/// Receives phase timings and cycle completions from runners.
pub trait StageObserver: Send + Sync {
    fn on_phase(&self, _stage: &str, _phase: Phase, _elapsed: Duration) {}

    fn on_cycle(&self, _stage: &str, _report: &CycleReport) {}

    fn on_state_change(&self, _stage: &str, _state: RunState) {}
}

/// Logs lifecycle changes and stalls through `tracing`.
#[derive(Default)]
pub struct TracingObserver {
    last_stall_log: Mutex<HashMap<String, Instant>>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StageObserver for TracingObserver {
    fn on_cycle(&self, stage: &str, report: &CycleReport) {
        tracing::trace!(
            "{} cycle {}: assimilate {:?}, wait {:?}, compute {:?}",
            stage,
            report.cycle,
            report.assimilation,
            report.rate_wait,
            report.compute
        );
        if report.punctual {
            return;
        }
        let mut last = self.last_stall_log.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let due = last
            .get(stage)
            .map_or(true, |t| now.duration_since(*t) >= STALL_LOG_INTERVAL);
        if due {
            last.insert(stage.to_string(), now);
            let pending = report.inputs.iter().filter(|f| f.is_none()).count();
            tracing::warn!(
                "Stage '{}' stalled on cycle {}: {} input(s) not ready after {:?}",
                stage,
                report.cycle,
                pending,
                report.assimilation
            );
        }
    }

    fn on_state_change(&self, stage: &str, state: RunState) {
        tracing::info!("Stage '{}' is now {}", stage, state.label());
    }
}

/// Snapshot of one stage's counters and timers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageStats {
    pub name: String,
    pub state: &'static str,
    pub completed: u64,
    pub stalls: u64,
    pub publishes: u64,
    pub skipped_publishes: u64,
    pub stale_inputs: u64,
    pub is_computing: bool,
    /// Microseconds spent in the current compute, if one is running.
    pub computing_for_us: Option<f64>,
    pub avg_assimilation_us: f64,
    pub avg_rate_wait_us: f64,
    pub avg_compute_us: f64,
    pub avg_iteration_us: f64,
    /// Completed cycles per second over the stage's lifetime.
    pub effective_rate_hz: f64,
    /// Milliseconds since the stage last published, if it ever did.
    pub since_last_output_ms: Option<f64>,
}

impl StageStats {
    /// Share of cycles that missed their input deadline, in percent.
    pub fn stall_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.stalls as f64 / self.completed as f64 * 100.0
        }
    }
}

/// Mutable aggregates updated by one runner.
#[derive(Debug)]
pub struct StageMetrics {
    state: RunState,
    completed: u64,
    stalls: u64,
    publishes: u64,
    skipped_publishes: u64,
    stale_inputs: u64,
    compute_started: Option<Instant>,
    started: Option<Instant>,
    last_output: Option<Instant>,
    assimilation: MovingAverage,
    rate_wait: MovingAverage,
    compute: MovingAverage,
    iteration: MovingAverage,
}

impl StageMetrics {
    pub fn new(alpha: f64) -> Self {
        Self {
            state: RunState::NotStarted,
            completed: 0,
            stalls: 0,
            publishes: 0,
            skipped_publishes: 0,
            stale_inputs: 0,
            compute_started: None,
            started: None,
            last_output: None,
            assimilation: MovingAverage::new(alpha),
            rate_wait: MovingAverage::new(alpha),
            compute: MovingAverage::new(alpha),
            iteration: MovingAverage::new(alpha),
        }
    }

    pub fn set_state(&mut self, state: RunState) {
        if state == RunState::Running && self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.state = state;
    }

    pub fn begin_compute(&mut self) {
        self.compute_started = Some(Instant::now());
    }

    pub fn end_compute(&mut self) {
        self.compute_started = None;
    }

    pub fn record(&mut self, report: &CycleReport) {
        self.completed += 1;
        if !report.punctual {
            self.stalls += 1;
        }
        if report.published {
            self.publishes += 1;
            self.last_output = Some(Instant::now());
        }
        self.stale_inputs += report
            .inputs
            .iter()
            .filter(|f| matches!(f, Some(Freshness::Stale | Freshness::Missing)))
            .count() as u64;
        self.assimilation.record(report.assimilation);
        self.rate_wait.record(report.rate_wait);
        self.compute.record(report.compute);
        self.iteration.record(report.iteration);
    }

    pub fn record_skipped_publish(&mut self) {
        self.skipped_publishes += 1;
    }

    pub fn snapshot(&self, name: &str) -> StageStats {
        let now = Instant::now();
        let effective_rate_hz = match self.started {
            Some(started) if self.completed > 0 => {
                let secs = now.duration_since(started).as_secs_f64();
                if secs > 0.0 {
                    self.completed as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        StageStats {
            name: name.to_string(),
            state: self.state.label(),
            completed: self.completed,
            stalls: self.stalls,
            publishes: self.publishes,
            skipped_publishes: self.skipped_publishes,
            stale_inputs: self.stale_inputs,
            is_computing: self.compute_started.is_some(),
            computing_for_us: self
                .compute_started
                .map(|t| now.duration_since(t).as_secs_f64() * 1e6),
            avg_assimilation_us: self.assimilation.micros(),
            avg_rate_wait_us: self.rate_wait.micros(),
            avg_compute_us: self.compute.micros(),
            avg_iteration_us: self.iteration.micros(),
            effective_rate_hz,
            since_last_output_ms: self
                .last_output
                .map(|t| now.duration_since(t).as_secs_f64() * 1e3),
        }
    }
}

/// Named metrics cell shared between a runner and the registry.
#[derive(Debug)]
pub struct MetricsCell {
    name: String,
    inner: Mutex<StageMetrics>,
}

impl MetricsCell {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut StageMetrics) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn snapshot(&self) -> StageStats {
        self.update(|m| m.snapshot(&self.name))
    }
}

/// All stage metrics of one engine, in registration order.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    cells: RwLock<Vec<Arc<MetricsCell>>>,
    alpha: f64,
}

impl MetricsRegistry {
    pub fn new(alpha: f64) -> Self {
        Self {
            cells: RwLock::new(Vec::new()),
            alpha,
        }
    }

    pub fn register(&self, name: &str) -> Arc<MetricsCell> {
        let alpha = if self.alpha > 0.0 { self.alpha } else { DEFAULT_EMA_ALPHA };
        let cell = Arc::new(MetricsCell {
            name: name.to_string(),
            inner: Mutex::new(StageMetrics::new(alpha)),
        });
        self.cells
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(cell.clone());
        cell
    }

    pub fn get(&self, name: &str) -> Option<StageStats> {
        self.cells
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.snapshot())
    }

    pub fn snapshot(&self) -> Vec<StageStats> {
        self.cells
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }
}
