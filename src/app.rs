//! Application module
//!
//! Builds the reference boids topology from an [`AppConfig`]:
//!
//! ```text
//! [simulate] ──► particles ──► [index] ──► index ⇢ [simulate]   (read dirty)
//!                    │
//!                    └──► [rasterize] ──► density ──► [autoscale] ──► frames ──► [render]
//!                                                                        └──► [export]
//! ```
//!
//! `render` is the always-live stage: it keeps drawing, and reporting
//! "NO UPDATE", while the rest of the engine is paused.

use crate::config::{AppConfig, BindingSettings, StageSettings};
use crate::error::Result;
use crate::pipeline::stage::StageBuilder;
use crate::pipeline::{
    limiter_for, Binding, EngineBuilder, EngineState, Payload, PipelineError, PipelineResult,
    StageBuffer, StageId, StageSpec, TracingObserver,
};
use crate::pipeline::Engine;
use crate::render::{
    rasterize, Autoscaler, ColoredFrame, DensityFrame, FrameExporter, FrameRenderer, FrameSink,
};
use crate::sim::{Flock, Simulation, SpatialIndex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIMULATE: &str = "simulate";
pub const INDEX: &str = "index";
pub const RASTERIZE: &str = "rasterize";
pub const AUTOSCALE: &str = "autoscale";
pub const RENDER: &str = "render";
pub const EXPORT: &str = "export";

/// A built, not yet started, boids pipeline.
pub struct BoidsPipeline {
    pub engine: Engine,
    pub render: StageId,
    /// Mirrors the engine pause state for the render overlay.
    paused: Arc<AtomicBool>,
}

impl BoidsPipeline {
    pub fn start(&mut self) -> Result<()> {
        self.engine.start()?;
        Ok(())
    }

    pub fn toggle_pause(&mut self) -> Result<EngineState> {
        let state = self.engine.toggle_pause()?;
        self.paused.store(state == EngineState::Paused, Ordering::Relaxed);
        Ok(state)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }
}

/// The one binding of a single-input stage, checked against its settings.
fn single_input<'a>(stage: &str, settings: &'a StageSettings) -> PipelineResult<&'a BindingSettings> {
    match settings.inputs.as_slice() {
        [only] => Ok(only),
        inputs => Err(PipelineError::InputCountMismatch {
            stage: stage.to_string(),
            expected: 1,
            actual: inputs.len(),
        }),
    }
}

fn bind<T: Payload>(
    buffer: &Arc<StageBuffer<T>>,
    stage: &str,
    settings: &StageSettings,
) -> PipelineResult<(Binding<T>,)> {
    let input = single_input(stage, settings)?;
    let mut builder = Binding::on(buffer)
        .mode(input.mode)
        .allow_stale_on_timeout(input.allow_stale_on_timeout);
    if let Some(count) = input.reuse_count {
        builder = builder.reuse_count(count);
    }
    if let Some(millis) = input.timeout_ms {
        builder = builder.timeout_ms(millis);
    }
    if let Some(tolerance) = input.reuse_tolerance {
        builder = builder.reuse_tolerance(tolerance);
    }
    Ok((builder.build()?,))
}

/// Apply the scheduling part of `settings`; call after `output`.
fn schedule<I, O>(
    builder: StageBuilder<I, O>,
    stage: &str,
    settings: &StageSettings,
) -> PipelineResult<StageBuilder<I, O>> {
    let mut builder = builder
        .rate_limiter(limiter_for(stage, settings.rate_strategy, settings.rate_hz)?)
        .output_every_skip(settings.output_every_skip)
        .await_release(settings.await_release);
    if let Some(millis) = settings.input_timeout_ms {
        builder = builder.input_timeout_ms(millis);
    }
    Ok(builder)
}

fn output_buffer<T: Payload>(
    engine: &mut EngineBuilder,
    name: &str,
    settings: &StageSettings,
) -> PipelineResult<Arc<StageBuffer<T>>> {
    engine.buffer_checked(name, settings.output_capacity)
}

/// Build the reference topology. Every policy error is reported here,
/// before any thread starts.
///
/// `raster` is the grid size in terminal cells; frames go to `sink`.
pub fn build_pipeline(
    config: &AppConfig,
    raster: (u16, u16),
    sink: Box<dyn FrameSink>,
) -> Result<BoidsPipeline> {
    config.validate()?;
    let p = &config.pipeline;
    let mut engine = EngineBuilder::with_metrics_alpha(p.metrics_alpha);
    engine
        .join_grace(Duration::from_millis(p.join_grace_ms))
        .observer(Arc::new(TracingObserver::new()));

    let particles = output_buffer::<Flock>(&mut engine, "particles", &p.simulate)?;
    let index = output_buffer::<SpatialIndex>(&mut engine, "index", &p.index)?;
    let density = output_buffer::<DensityFrame>(&mut engine, "density", &p.rasterize)?;
    let frames = output_buffer::<ColoredFrame>(&mut engine, "frames", &p.autoscale)?;

    // simulate: advance one step with whatever index is available.
    let mut sim = Simulation::new(&config.simulation);
    let cell_size = sim.cell_size();
    let spec = schedule(
        StageSpec::builder(SIMULATE)
            .inputs(bind(&index, SIMULATE, &p.simulate)?)
            .output(&particles, p.simulate.overwrite),
        SIMULATE,
        &p.simulate,
    )?
    .evaluate(move |_, (index,): (SpatialIndex,)| sim.advance(&index))?;
    engine.stage(spec)?;

    let spec = schedule(
        StageSpec::builder(INDEX)
            .inputs(bind(&particles, INDEX, &p.index)?)
            .output(&index, p.index.overwrite),
        INDEX,
        &p.index,
    )?
    .evaluate(move |_, (flock,): (Flock,)| {
        SpatialIndex::build(&flock.boids, flock.world, cell_size, flock.step)
    })?;
    engine.stage(spec)?;

    let (cols, rows) = raster;
    let spec = schedule(
        StageSpec::builder(RASTERIZE)
            .inputs(bind(&particles, RASTERIZE, &p.rasterize)?)
            .output(&density, p.rasterize.overwrite),
        RASTERIZE,
        &p.rasterize,
    )?
    .evaluate(move |_, (flock,): (Flock,)| rasterize(&flock, cols, rows))?;
    engine.stage(spec)?;

    let mut scaler = Autoscaler::new(config.render.color_levels);
    let spec = schedule(
        StageSpec::builder(AUTOSCALE)
            .inputs(bind(&density, AUTOSCALE, &p.autoscale)?)
            .output(&frames, p.autoscale.overwrite),
        AUTOSCALE,
        &p.autoscale,
    )?
    .evaluate(move |_, (density,): (DensityFrame,)| scaler.scale(&density))?;
    engine.stage(spec)?;

    // render: a frame is only "new" when the simulation advanced.
    let paused = Arc::new(AtomicBool::new(false));
    let mut renderer = FrameRenderer::new(
        sink,
        Duration::from_millis(config.render.watchdog_ms),
        paused.clone(),
    );
    if config.render.show_status {
        renderer = renderer.with_status(engine.metrics());
    }
    let mut last_step = None;
    let spec = schedule(
        StageSpec::builder(RENDER)
            .inputs(bind(&frames, RENDER, &p.render)?),
        RENDER,
        &p.render,
    )?
    .evaluate(move |ctx, (frame,): (ColoredFrame,)| {
        let fresh = ctx.is_fresh(0) && frame.sequence != 0 && last_step != Some(frame.step);
        if fresh {
            last_step = Some(frame.step);
        }
        renderer.draw(fresh, &frame);
    })?;
    let render = engine.stage(spec)?;
    engine.always_live(render)?;

    if config.export.enabled {
        let mut exporter = FrameExporter::open(&config.export)?;
        let spec = schedule(
            StageSpec::builder(EXPORT)
                .inputs(bind(&frames, EXPORT, &p.export)?),
            EXPORT,
            &p.export,
        )?
        .evaluate(move |ctx, (frame,): (ColoredFrame,)| {
            if !ctx.is_fresh(0) {
                return;
            }
            if let Err(e) = exporter.write(&frame) {
                tracing::warn!("Export to {:?} failed: {}", exporter.path(), e);
            }
        })?;
        engine.stage(spec)?;
    }

    let engine = engine.build();
    tracing::info!(
        "Topology ready: {} stages, raster {}x{}",
        engine.stages().len(),
        cols,
        rows
    );
    Ok(BoidsPipeline {
        engine,
        render,
        paused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoidsError;
    use crate::render::HeadlessSink;

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.simulation.particles = 40;
        config.simulation.seed = Some(3);
        config
    }

    fn pipeline_error(result: Result<BoidsPipeline>) -> PipelineError {
        match result {
            Err(BoidsError::Pipeline(e)) => e,
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected a pipeline error"),
        }
    }

    #[test]
    fn test_reference_topology_shape() {
        let pipeline = build_pipeline(&small_config(), (20, 10), Box::new(HeadlessSink::new(0))).unwrap();
        let stages = pipeline.engine.stages();
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [SIMULATE, INDEX, RASTERIZE, AUTOSCALE, RENDER]);
        assert_eq!(stages[0].inputs, ["index"]);
        assert_eq!(stages[4].output, None);
        assert_eq!(pipeline.engine.stage_id(RENDER), Some(pipeline.render));
    }

    #[test]
    fn test_input_count_mismatch_reported() {
        let mut config = small_config();
        config.pipeline.rasterize.inputs.clear();
        assert!(matches!(
            pipeline_error(build_pipeline(&config, (8, 8), Box::new(HeadlessSink::new(0)))),
            PipelineError::InputCountMismatch { expected: 1, actual: 0, .. }
        ));
    }

    #[test]
    fn test_invalid_policies_reported() {
        let mut config = small_config();
        config.pipeline.autoscale.output_capacity = -1;
        assert!(matches!(
            pipeline_error(build_pipeline(&config, (8, 8), Box::new(HeadlessSink::new(0)))),
            PipelineError::InvalidCapacity { capacity: -1, .. }
        ));

        let mut config = small_config();
        config.pipeline.index.inputs[0].reuse_count = Some(0);
        assert!(matches!(
            pipeline_error(build_pipeline(&config, (8, 8), Box::new(HeadlessSink::new(0)))),
            PipelineError::InvalidReuseCount { count: 0, .. }
        ));

        let mut config = small_config();
        config.pipeline.render.rate_hz = 0.0;
        assert!(matches!(
            pipeline_error(build_pipeline(&config, (8, 8), Box::new(HeadlessSink::new(0)))),
            PipelineError::InvalidRate { .. }
        ));
    }
}
