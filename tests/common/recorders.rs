//! Recording sinks and observers for inspecting a running pipeline

use boidstream::pipeline::{CycleReport, Freshness, RunState, StageObserver};
use boidstream::render::{ColoredFrame, FrameSink, Overlay};
use std::sync::{Arc, Mutex};

/// What a [`RecordingSink`] saw on one present call.
#[derive(Debug, Clone)]
pub struct Presented {
    pub sequence: u64,
    pub step: u64,
    pub boids: u64,
    pub paused: bool,
    pub no_update: bool,
}

/// Frame sink that records every present call.
#[derive(Clone, Default)]
pub struct RecordingSink {
    seen: Arc<Mutex<Vec<Presented>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Presented> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl FrameSink for RecordingSink {
    fn present(&mut self, frame: &ColoredFrame, overlay: &Overlay) -> boidstream::Result<()> {
        self.seen.lock().unwrap().push(Presented {
            sequence: frame.sequence,
            step: frame.step,
            boids: frame.summary.boids,
            paused: overlay.paused,
            no_update: overlay.no_update_for.is_some(),
        });
        Ok(())
    }
}

/// Observer that keeps every cycle report and state change per stage.
#[derive(Default)]
pub struct RecordingObserver {
    cycles: Mutex<Vec<(String, CycleReport)>>,
    states: Mutex<Vec<(String, RunState)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cycles_of(&self, stage: &str) -> Vec<CycleReport> {
        self.cycles
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == stage)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Freshness of input `index` over every recorded cycle of `stage`.
    pub fn freshness_of(&self, stage: &str, index: usize) -> Vec<Option<Freshness>> {
        self.cycles_of(stage)
            .iter()
            .map(|r| r.inputs.get(index).copied().flatten())
            .collect()
    }

    pub fn states_of(&self, stage: &str) -> Vec<RunState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == stage)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl StageObserver for RecordingObserver {
    fn on_cycle(&self, stage: &str, report: &CycleReport) {
        self.cycles
            .lock()
            .unwrap()
            .push((stage.to_string(), report.clone()));
    }

    fn on_state_change(&self, stage: &str, state: RunState) {
        self.states.lock().unwrap().push((stage.to_string(), state));
    }
}
