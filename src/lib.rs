//! # boidstream: concurrent staged boids simulator
//!
//! A boids flocking simulation driven by a multi-threaded staged dataflow
//! engine and drawn as a density map in the terminal. Every stage runs at
//! its own cadence on its own threads and talks to its neighbours only
//! through named, bounded stage buffers.
//!
//! ## Architecture
//!
//! - **Pipeline**: the generic engine (buffers, bindings, stage runners,
//!   rate limiters, metrics); knows nothing about boids
//! - **Sim**: boids physics and a uniform-grid spatial index
//! - **Render**: rasterization, color autoscale, terminal/headless sinks and
//!   a JSON-lines exporter
//! - **App**: wires the reference topology from the configuration
//! - **Communication**: crossbeam channels for all cross-thread signalling
//!
//! ## Configuration
//!
//! Settings are read from TOML, by default from the platform config dir
//! under `boidstream/config.toml`:
//!
//! - **Linux**: `~/.config/boidstream/`
//! - **macOS**: `~/Library/Application Support/boidstream/`
//! - **Windows**: `%APPDATA%\boidstream\`
//!
//! ## Example
//!
//! ```ignore
//! use boidstream::{app::build_pipeline, config::AppConfig, render::HeadlessSink};
//!
//! let config = AppConfig::load_or_default(None);
//! let sink = HeadlessSink::new(100);
//! let frames = sink.counter();
//! let mut pipeline = build_pipeline(&config, (80, 24), Box::new(sink))?;
//! pipeline.start()?;
//! while frames.distinct() < 300 {
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! pipeline.stop();
//! println!("{:#?}", pipeline.engine.summary());
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod sim;

pub use error::{BoidsError, Result, ResultExt};
