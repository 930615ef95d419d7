//! Multi-threaded staged dataflow engine.
//!
//! Stages compute at their own cadence and communicate through named,
//! bounded [`StageBuffer`]s. Each stage reads its inputs through a
//! [`Binding`] that decides how to wait (consume, wait for a publish,
//! read the latest, or read without waiting) and how long.
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────── Engine ──────────────┐
//!            │                                    │
//! [simulate] ──► particles ──► [rasterize] ──► density ──► [autoscale] ──► frames ──► [render]
//!     ▲               │                                                       └──► [export]
//!     │               ▼
//!   index ◄──── [index]
//! ```
//!
//! # Threads
//!
//! - One compute thread per stage: rate limit → evaluate → publish.
//! - One input thread per binding, gated by the compute thread so every
//!   input is assimilated exactly once per cycle.
//! - Buffers signal listeners through coalescing crossbeam channels.

pub mod binding;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod id;
pub mod metrics;
pub mod rate;
pub mod runner;
pub mod stage;

pub use binding::{Binding, BindingBuilder, BindingCursor, Captured, Freshness, ReadMode};
pub use buffer::{BufferControl, BufferStats, Payload, Signal, StageBuffer};
pub use engine::{Engine, EngineBuilder, EngineState, RunSummary, StageInfo};
pub use error::{Closed, PipelineError, PipelineResult};
pub use id::{BufferId, StageId};
pub use metrics::{
    CycleReport, MetricsRegistry, Phase, StageObserver, StageStats, TracingObserver,
};
pub use rate::{limiter_for, RateLimiter, RateStrategy};
pub use runner::{RunState, StageRunner};
pub use stage::{CycleContext, PublishOutcome, StageDefinition, StageSpec};
