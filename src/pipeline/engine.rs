//! Engine: owns every buffer and stage runner of one static topology.
//!
//! The topology is declared through [`EngineBuilder`] and frozen by
//! [`EngineBuilder::build`]. Threads only exist between [`Engine::start`]
//! and [`Engine::stop`]:
//!
//! ```text
//! NotStarted ──start──► Running ◄──pause/resume──► Paused
//!      │                   │                          │
//!      └──────────────────stop──────────────────────► Stopped
//! ```

use crate::pipeline::buffer::{BufferControl, BufferStats, Payload, StageBuffer};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{BufferId, StageId};
use crate::pipeline::metrics::{MetricsRegistry, StageObserver, StageStats, DEFAULT_EMA_ALPHA};
use crate::pipeline::runner::{RunState, StageRunner};
use crate::pipeline::stage::StageDefinition;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bounded-join grace period at stop.
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_millis(500);

/// Engine lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

impl EngineState {
    pub fn label(self) -> &'static str {
        match self {
            EngineState::NotStarted => "not started",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Static description of one stage, for display and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub id: u32,
    pub name: String,
    pub inputs: Vec<String>,
    pub output: Option<String>,
}

/// What a finished (or running) engine reports about its run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub stages: Vec<StageStats>,
    pub buffers: Vec<BufferStats>,
}

/// Declares buffers and stages; the topology cannot change after `build`.
pub struct EngineBuilder {
    buffers: Vec<Arc<dyn BufferControl>>,
    stages: Vec<Box<dyn StageDefinition>>,
    always_live: Option<StageId>,
    observers: Vec<Arc<dyn StageObserver>>,
    join_grace: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::with_metrics_alpha(DEFAULT_EMA_ALPHA)
    }

    /// Builder whose moving averages use smoothing factor `alpha`.
    pub fn with_metrics_alpha(alpha: f64) -> Self {
        Self {
            buffers: Vec::new(),
            stages: Vec::new(),
            always_live: None,
            observers: Vec::new(),
            join_grace: DEFAULT_JOIN_GRACE,
            metrics: Arc::new(MetricsRegistry::new(alpha)),
        }
    }

    fn add_buffer<T: Payload>(&mut self, buffer: StageBuffer<T>) -> PipelineResult<Arc<StageBuffer<T>>> {
        if self.buffers.iter().any(|b| b.name() == buffer.name()) {
            return Err(PipelineError::DuplicateBuffer(buffer.name().to_string()));
        }
        let id = BufferId(self.buffers.len() as u32);
        let buffer = Arc::new(buffer);
        self.buffers.push(buffer.clone());
        tracing::debug!("Buffer {} '{}' (capacity {})", id, buffer.name(), buffer.capacity());
        Ok(buffer)
    }

    /// Id of `buffer` if it is one of this engine's buffers. Identity, not
    /// name: a same-named buffer from elsewhere is not ours.
    fn resolve(&self, buffer: &Arc<dyn BufferControl>) -> Option<BufferId> {
        let wanted = Arc::as_ptr(buffer) as *const ();
        self.buffers
            .iter()
            .position(|b| Arc::as_ptr(b) as *const () == wanted)
            .map(|i| BufferId(i as u32))
    }

    /// Declare a buffer owned by this engine.
    pub fn buffer<T: Payload>(
        &mut self,
        name: &str,
        capacity: usize,
    ) -> PipelineResult<Arc<StageBuffer<T>>> {
        self.add_buffer(StageBuffer::new(name, capacity))
    }

    /// Declare a buffer from a signed, possibly invalid capacity.
    pub fn buffer_checked<T: Payload>(
        &mut self,
        name: &str,
        capacity: i64,
    ) -> PipelineResult<Arc<StageBuffer<T>>> {
        self.add_buffer(StageBuffer::with_capacity(name, capacity)?)
    }

    /// Add a stage. Its output buffer gets this stage as its only writer.
    pub fn stage(&mut self, spec: impl StageDefinition + 'static) -> PipelineResult<StageId> {
        if self.stages.iter().any(|s| s.name() == spec.name()) {
            return Err(PipelineError::DuplicateStage(spec.name().to_string()));
        }
        let wired = spec
            .buffers()
            .iter()
            .map(|buffer| {
                self.resolve(buffer).ok_or_else(|| PipelineError::UnknownBuffer {
                    stage: spec.name().to_string(),
                    buffer: buffer.name().to_string(),
                })
            })
            .collect::<PipelineResult<Vec<BufferId>>>()?;
        spec.claim_output()?;

        let id = StageId(self.stages.len() as u32);
        tracing::debug!("Stage {} '{}' wired to buffers {:?}", id, spec.name(), wired);
        self.stages.push(Box::new(spec));
        Ok(id)
    }

    /// Exempt one stage from engine-wide pause/resume.
    pub fn always_live(&mut self, id: StageId) -> PipelineResult<()> {
        if id.index() >= self.stages.len() {
            return Err(PipelineError::UnknownStage(id));
        }
        self.always_live = Some(id);
        Ok(())
    }

    pub fn observer(&mut self, observer: Arc<dyn StageObserver>) -> &mut Self {
        self.observers.push(observer);
        self
    }

    pub fn join_grace(&mut self, grace: Duration) -> &mut Self {
        self.join_grace = grace;
        self
    }

    /// Registry the engine's runners will report into.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn build(self) -> Engine {
        let infos = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| StageInfo {
                id: i as u32,
                name: s.name().to_string(),
                inputs: s.input_sources(),
                output: s.output_buffer().map(str::to_string),
            })
            .collect();
        Engine {
            state: EngineState::NotStarted,
            buffers: self.buffers,
            definitions: self.stages,
            infos,
            runners: Vec::new(),
            paused_before: Vec::new(),
            always_live: self.always_live,
            observers: self.observers,
            metrics: self.metrics,
            join_grace: self.join_grace,
            started: None,
            started_at: None,
            ended: None,
        }
    }
}

/// Owner of a running (or runnable) pipeline.
pub struct Engine {
    state: EngineState,
    buffers: Vec<Arc<dyn BufferControl>>,
    definitions: Vec<Box<dyn StageDefinition>>,
    infos: Vec<StageInfo>,
    runners: Vec<StageRunner>,
    /// Per runner: whether it was already paused when the engine paused.
    paused_before: Vec<bool>,
    always_live: Option<StageId>,
    observers: Vec<Arc<dyn StageObserver>>,
    metrics: Arc<MetricsRegistry>,
    join_grace: Duration,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ended: Option<Instant>,
}

impl Engine {
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stages(&self) -> &[StageInfo] {
        &self.infos
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.infos
            .iter()
            .find(|s| s.name == name)
            .map(|s| StageId(s.id))
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Start every stage runner.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.state != EngineState::NotStarted {
            return Err(PipelineError::InvalidState {
                state: self.state.label(),
                op: "start",
            });
        }
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.state = EngineState::Running;

        let definitions = std::mem::take(&mut self.definitions);
        for (index, definition) in definitions.into_iter().enumerate() {
            let cell = self.metrics.register(definition.name());
            let parts = definition.into_parts();
            match StageRunner::start(StageId(index as u32), parts, cell, self.observers.clone()) {
                Ok(runner) => self.runners.push(runner),
                Err(e) => {
                    tracing::error!("Engine start failed: {}", e);
                    self.stop();
                    return Err(e);
                }
            }
        }
        self.paused_before = vec![false; self.runners.len()];
        tracing::info!(
            "Engine started: {} stages, {} buffers",
            self.runners.len(),
            self.buffers.len()
        );
        Ok(())
    }

    fn is_always_live(&self, runner: &StageRunner) -> bool {
        self.always_live == Some(runner.id())
    }

    /// Pause every runner except the always-live one, remembering which
    /// runners were already paused.
    pub fn pause(&mut self) -> PipelineResult<()> {
        if self.state != EngineState::Running {
            return Err(PipelineError::InvalidState {
                state: self.state.label(),
                op: "pause",
            });
        }
        for (runner, before) in self.runners.iter().zip(self.paused_before.iter_mut()) {
            if self.always_live == Some(runner.id()) {
                continue;
            }
            *before = runner.is_paused();
            runner.pause();
        }
        self.state = EngineState::Paused;
        tracing::info!("Engine paused");
        Ok(())
    }

    /// Resume the runners the last `pause` actually paused.
    pub fn resume(&mut self) -> PipelineResult<()> {
        if self.state != EngineState::Paused {
            return Err(PipelineError::InvalidState {
                state: self.state.label(),
                op: "resume",
            });
        }
        for (runner, before) in self.runners.iter().zip(self.paused_before.iter()) {
            if self.is_always_live(runner) || *before {
                continue;
            }
            runner.resume();
        }
        self.state = EngineState::Running;
        tracing::info!("Engine resumed");
        Ok(())
    }

    /// Toggle between running and paused.
    pub fn toggle_pause(&mut self) -> PipelineResult<EngineState> {
        match self.state {
            EngineState::Running => self.pause()?,
            EngineState::Paused => self.resume()?,
            state => {
                return Err(PipelineError::InvalidState {
                    state: state.label(),
                    op: "toggle pause",
                })
            }
        }
        Ok(self.state)
    }

    fn runner(&self, id: StageId) -> PipelineResult<&StageRunner> {
        self.runners
            .get(id.index())
            .ok_or(PipelineError::UnknownStage(id))
    }

    /// Pause a single stage.
    pub fn pause_stage(&self, id: StageId) -> PipelineResult<bool> {
        Ok(self.runner(id)?.pause())
    }

    /// Resume a single stage.
    pub fn resume_stage(&self, id: StageId) -> PipelineResult<bool> {
        Ok(self.runner(id)?.resume())
    }

    pub fn stage_state(&self, id: StageId) -> PipelineResult<RunState> {
        Ok(self.runner(id)?.state())
    }

    /// Stop every runner and close every buffer. Idempotent.
    ///
    /// Runners get a shared grace period to exit; threads still blocked
    /// after it are abandoned rather than killed.
    pub fn stop(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        self.ended = Some(Instant::now());
        self.state = EngineState::Stopped;

        for runner in &self.runners {
            runner.stop();
        }
        for buffer in &self.buffers {
            buffer.close();
        }
        let deadline = Instant::now() + self.join_grace;
        for runner in &self.runners {
            runner.dispose(deadline.saturating_duration_since(Instant::now()));
        }
        tracing::info!(
            "Engine stopped after {:.2}s",
            self.run_interval().unwrap_or_default().as_secs_f64()
        );
    }

    /// Wall-clock interval between start and stop (or now, while running).
    pub fn run_interval(&self) -> Option<Duration> {
        let started = self.started?;
        Some(self.ended.unwrap_or_else(Instant::now).duration_since(started))
    }

    pub fn buffer_stats(&self) -> Vec<BufferStats> {
        self.buffers.iter().map(|b| b.stats()).collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            started_at: self.started_at,
            duration_secs: self.run_interval().map(|d| d.as_secs_f64()),
            stages: self.metrics.snapshot(),
            buffers: self.buffer_stats(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::binding::Binding;
    use crate::pipeline::rate::Deadline;
    use crate::pipeline::stage::StageSpec;

    fn ticker(builder: &mut EngineBuilder, name: &str) -> StageId {
        let out = builder.buffer::<u64>(&format!("{}-out", name), 1).unwrap();
        let mut n = 0u64;
        let spec = StageSpec::builder(name)
            .output(&out, true)
            .rate_limiter(Box::new(Deadline::new(Duration::from_millis(2))))
            .evaluate(move |_, ()| {
                n += 1;
                n
            })
            .unwrap();
        builder.stage(spec).unwrap()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut builder = EngineBuilder::new();
        ticker(&mut builder, "a");
        let mut engine = builder.build();
        assert_eq!(engine.state(), EngineState::NotStarted);
        assert!(engine.pause().is_err());

        engine.start().unwrap();
        assert!(engine.start().is_err());
        assert_eq!(engine.toggle_pause().unwrap(), EngineState::Paused);
        assert_eq!(engine.toggle_pause().unwrap(), EngineState::Running);

        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.resume().is_err());
        assert!(engine.run_interval().is_some());
    }

    #[test]
    fn test_duplicate_and_unknown_names_rejected() {
        let mut builder = EngineBuilder::new();
        builder.buffer::<u32>("x", 1).unwrap();
        assert_eq!(
            builder.buffer::<u32>("x", 1).err(),
            Some(PipelineError::DuplicateBuffer("x".to_string()))
        );
        assert!(builder.buffer_checked::<u32>("neg", -2).is_err());

        let stray = Arc::new(StageBuffer::<u32>::new("stray", 1));
        let spec = StageSpec::builder("reader")
            .inputs((Binding::on(&stray).build().unwrap(),))
            .evaluate(|_, (_v,): (u32,)| ())
            .unwrap();
        assert!(matches!(
            builder.stage(spec),
            Err(PipelineError::UnknownBuffer { .. })
        ));
        assert!(builder.always_live(StageId(7)).is_err());
    }

    #[test]
    fn test_same_named_foreign_buffer_rejected() {
        let mut builder = EngineBuilder::new();
        let owned = builder.buffer::<u32>("x", 1).unwrap();
        let foreign = Arc::new(StageBuffer::<u32>::new("x", 1));

        let reader = StageSpec::builder("reader")
            .inputs((Binding::on(&foreign).build().unwrap(),))
            .evaluate(|_, (_v,): (u32,)| ())
            .unwrap();
        assert!(matches!(
            builder.stage(reader),
            Err(PipelineError::UnknownBuffer { ref buffer, .. }) if buffer == "x"
        ));

        let writer = StageSpec::builder("writer")
            .output(&foreign, true)
            .evaluate(|_, ()| 1)
            .unwrap();
        assert!(matches!(
            builder.stage(writer),
            Err(PipelineError::UnknownBuffer { .. })
        ));
        assert_eq!(foreign.stats().writer, None);

        // The engine's own buffer of that name is still usable.
        let writer = StageSpec::builder("writer")
            .output(&owned, true)
            .evaluate(|_, ()| 1)
            .unwrap();
        builder.stage(writer).unwrap();
        assert_eq!(owned.stats().writer.as_deref(), Some("writer"));
    }

    #[test]
    fn test_second_writer_rejected() {
        let mut builder = EngineBuilder::new();
        let out = builder.buffer::<u32>("shared", 1).unwrap();
        let first = StageSpec::builder("w1").output(&out, true).evaluate(|_, ()| 1).unwrap();
        let second = StageSpec::builder("w2").output(&out, true).evaluate(|_, ()| 2).unwrap();
        builder.stage(first).unwrap();
        assert!(matches!(
            builder.stage(second),
            Err(PipelineError::WriterAlreadyBound { .. })
        ));
    }

    #[test]
    fn test_pause_preserves_individually_paused_stage() {
        let mut builder = EngineBuilder::new();
        let a = ticker(&mut builder, "a");
        let b = ticker(&mut builder, "b");
        let live = ticker(&mut builder, "live");
        builder.always_live(live).unwrap();
        let mut engine = builder.build();
        engine.start().unwrap();

        assert!(engine.pause_stage(a).unwrap());
        engine.pause().unwrap();
        assert_eq!(engine.stage_state(a).unwrap(), RunState::Paused);
        assert_eq!(engine.stage_state(b).unwrap(), RunState::Paused);
        assert_eq!(engine.stage_state(live).unwrap(), RunState::Running);

        engine.resume().unwrap();
        assert_eq!(engine.stage_state(a).unwrap(), RunState::Paused);
        assert_eq!(engine.stage_state(b).unwrap(), RunState::Running);
        assert_eq!(engine.stage_state(live).unwrap(), RunState::Running);

        engine.stop();
        assert_eq!(engine.stage_state(a).unwrap(), RunState::Stopped);
    }

    #[test]
    fn test_summary_lists_stages_and_buffers() {
        let mut builder = EngineBuilder::new();
        ticker(&mut builder, "a");
        let mut engine = builder.build();
        assert_eq!(engine.stage_id("a"), Some(StageId(0)));
        assert_eq!(engine.stages()[0].output.as_deref(), Some("a-out"));
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.stop();

        let summary = engine.summary();
        assert_eq!(summary.stages.len(), 1);
        assert!(summary.stages[0].completed > 0);
        assert_eq!(summary.buffers.len(), 1);
        assert!(summary.buffers[0].closed);
        assert!(summary.started_at.is_some());
    }
}
