//! Settings sections of the configuration file
//!
//! Every section has serde defaults for every field, so a partial file only
//! overrides what it names.
//!
//! # Main Types
//!
//! - [`SimulationSettings`] - Flock size, world and steering weights
//! - [`RenderSettings`] - Grid size, watchdog and status line
//! - [`ExportSettings`] - JSON-lines frame summaries
//! - [`PipelineSettings`] - One [`StageSettings`] per reference stage
//!
//! # Stage Policies
//!
//! A stage table replaces the whole default for that stage, including its
//! `inputs` list, which must have one entry per stage input:
//!
//! ```toml
//! [pipeline.render]
//! rate_hz = 30.0
//! rate_strategy = "vsync"
//!
//! [[pipeline.render.inputs]]
//! mode = "consume"
//! timeout_ms = 100
//! allow_stale_on_timeout = true
//! ```

use crate::pipeline::{ReadMode, RateStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ==================== Simulation ====================

/// Boids flocking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Number of boids
    pub particles: usize,

    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,

    /// World width in world units (the world wraps at its edges)
    pub world_width: f32,

    /// World height in world units
    pub world_height: f32,

    /// Integration step in seconds
    pub dt: f32,

    pub min_speed: f32,
    pub max_speed: f32,

    /// Neighbour radius for cohesion and alignment
    pub perception_radius: f32,

    /// Neighbour radius for separation
    pub separation_radius: f32,

    pub separation_weight: f32,
    pub alignment_weight: f32,
    pub cohesion_weight: f32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            particles: 600,
            seed: None,
            world_width: 160.0,
            world_height: 90.0,
            dt: 1.0 / 30.0,
            min_speed: 6.0,
            max_speed: 24.0,
            perception_radius: 8.0,
            separation_radius: 3.0,
            separation_weight: 30.0,
            alignment_weight: 2.0,
            cohesion_weight: 1.0,
        }
    }
}

// ==================== Render ====================

/// Terminal output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Raster columns; 0 uses the terminal width
    pub columns: u16,

    /// Raster rows; 0 uses the terminal height minus the status line
    pub rows: u16,

    /// Draw the "NO UPDATE" banner after this long without a fresh frame
    pub watchdog_ms: u64,

    /// Show per-stage metrics under the frame
    pub show_status: bool,

    /// Number of color levels the autoscaler maps densities onto
    pub color_levels: u8,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            columns: 0,
            rows: 0,
            watchdog_ms: 500,
            show_status: true,
            color_levels: 8,
        }
    }
}

impl RenderSettings {
    /// Grid size used when the terminal size is unknown (headless mode)
    pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

    /// Rows reserved under the raster for the status line
    pub fn status_rows(&self) -> u16 {
        if self.show_status {
            2
        } else {
            0
        }
    }

    /// Resolve the raster size against an available terminal area.
    pub fn raster_size(&self, available: (u16, u16)) -> (u16, u16) {
        let (cols, rows) = available;
        let columns = if self.columns == 0 { cols } else { self.columns };
        let rows = if self.rows == 0 {
            rows.saturating_sub(self.status_rows())
        } else {
            self.rows
        };
        (columns.max(1), rows.max(1))
    }
}

// ==================== Export ====================

/// Frame summary export settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Whether the export stage is part of the topology
    pub enabled: bool,

    /// Output file (JSON lines)
    pub path: PathBuf,

    /// Append instead of truncating an existing file
    pub append: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("boidstream_frames.jsonl"),
            append: false,
        }
    }
}

// ==================== Pipeline ====================

/// Read policy of one stage input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingSettings {
    pub mode: ReadMode,

    /// Per-read timeout; `None` waits indefinitely
    pub timeout_ms: Option<i64>,

    /// Serve the last captured value when a read times out
    pub allow_stale_on_timeout: bool,

    /// Cycles the captured value is reused between fresh reads
    pub reuse_count: Option<i64>,

    /// Cap on consecutive reused reads
    pub reuse_tolerance: Option<i64>,
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            mode: ReadMode::Consume,
            timeout_ms: None,
            allow_stale_on_timeout: false,
            reuse_count: None,
            reuse_tolerance: None,
        }
    }
}

impl BindingSettings {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, millis: i64, allow_stale: bool) -> Self {
        self.timeout_ms = Some(millis);
        self.allow_stale_on_timeout = allow_stale;
        self
    }
}

/// Scheduling and output policy of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub rate_hz: f64,
    pub rate_strategy: RateStrategy,

    /// Output buffer capacity; 0 is a rendezvous buffer. Ignored for
    /// stages without an output.
    pub output_capacity: i64,

    /// Publish-latest instead of enqueue
    pub overwrite: bool,

    /// Publish only every `output_every_skip + 1` cycles
    pub output_every_skip: u32,

    /// Wait for each enqueued value to be dequeued before the next cycle
    pub await_release: bool,

    /// Aggregate deadline for all inputs of one cycle
    pub input_timeout_ms: Option<i64>,

    pub inputs: Vec<BindingSettings>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            rate_hz: 30.0,
            rate_strategy: RateStrategy::Deadline,
            output_capacity: 1,
            overwrite: true,
            output_every_skip: 0,
            await_release: false,
            input_timeout_ms: None,
            inputs: Vec::new(),
        }
    }
}

impl StageSettings {
    fn with_inputs(rate_hz: f64, inputs: Vec<BindingSettings>) -> Self {
        Self {
            rate_hz,
            inputs,
            ..Self::default()
        }
    }
}

/// Policies of the reference topology, one table per stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Smoothing factor of the stage timing averages
    pub metrics_alpha: f64,

    /// Shared grace period for runner threads to exit at stop
    pub join_grace_ms: u64,

    pub simulate: StageSettings,
    pub index: StageSettings,
    pub rasterize: StageSettings,
    pub autoscale: StageSettings,
    pub render: StageSettings,
    pub export: StageSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        // simulate reads the index it fed earlier without waiting for it.
        let simulate = StageSettings::with_inputs(30.0, vec![BindingSettings::new(ReadMode::ReadDirty)]);

        let index = StageSettings::with_inputs(
            30.0,
            vec![BindingSettings::new(ReadMode::OnPublish).with_timeout(200, true)],
        );

        let rasterize = StageSettings {
            output_capacity: 2,
            overwrite: false,
            ..StageSettings::with_inputs(
                30.0,
                vec![BindingSettings::new(ReadMode::OnPublish).with_timeout(200, true)],
            )
        };

        let autoscale = StageSettings {
            overwrite: false,
            input_timeout_ms: Some(500),
            ..StageSettings::with_inputs(
                30.0,
                vec![BindingSettings::new(ReadMode::Consume).with_timeout(250, true)],
            )
        };

        let render = StageSettings {
            rate_strategy: RateStrategy::VSync,
            ..StageSettings::with_inputs(
                30.0,
                vec![BindingSettings::new(ReadMode::Consume).with_timeout(100, true)],
            )
        };

        let export = StageSettings::with_inputs(
            10.0,
            vec![BindingSettings::new(ReadMode::OnPublish).with_timeout(1000, false)],
        );

        Self {
            metrics_alpha: 0.1,
            join_grace_ms: 500,
            simulate,
            index,
            rasterize,
            autoscale,
            render,
            export,
        }
    }
}

impl PipelineSettings {
    /// Stage tables by stage name, in topology order.
    pub fn stages(&self) -> [(&'static str, &StageSettings); 6] {
        [
            ("simulate", &self.simulate),
            ("index", &self.index),
            ("rasterize", &self.rasterize),
            ("autoscale", &self.autoscale),
            ("render", &self.render),
            ("export", &self.export),
        ]
    }
}
