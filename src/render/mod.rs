//! Rendering collaborators of the pipeline.
//!
//! ```text
//! Flock ──rasterize──► DensityFrame ──autoscale──► ColoredFrame ──► FrameSink
//!                                                            └────► FrameExporter
//! ```

pub mod autoscale;
pub mod export;
pub mod raster;
pub mod terminal;

pub use autoscale::{Autoscaler, ColoredFrame, FrameSummary};
pub use export::{FrameExporter, FrameRecord};
pub use raster::{rasterize, DensityFrame};
pub use terminal::{
    format_status, palette, FrameCounter, FrameRenderer, FrameSink, HeadlessSink, Overlay,
    TerminalSink, Watchdog,
};
