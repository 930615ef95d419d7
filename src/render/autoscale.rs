//! Rank-based color autoscale.
//!
//! Densities are mapped to color levels by their rank among the distinct
//! non-zero densities of the frame, so a few very dense cells do not wash
//! out the rest of the flock. Empty cells always map to level 0.

use super::raster::DensityFrame;
use serde::Serialize;
use std::sync::Arc;

/// Density frame quantized to color levels, ready to draw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColoredFrame {
    /// Monotonic frame number assigned by the autoscaler
    pub sequence: u64,
    pub step: u64,
    pub cols: u16,
    pub rows: u16,
    /// Number of levels, including level 0 for empty cells
    pub levels: u8,
    pub cells: Arc<Vec<u8>>,
    pub summary: FrameSummary,
}

/// Scalar description of a frame, used by the status line and the exporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FrameSummary {
    pub boids: u64,
    pub occupied: usize,
    pub max_density: u32,
    /// Density at the 90th percentile of occupied cells
    pub p90_density: u32,
}

impl ColoredFrame {
    pub fn level(&self, col: u16, row: u16) -> u8 {
        self.cells
            .get(row as usize * self.cols as usize + col as usize)
            .copied()
            .unwrap_or(0)
    }
}

/// Stateful autoscaler; owns the frame sequence counter.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    levels: u8,
    sequence: u64,
}

impl Autoscaler {
    pub fn new(levels: u8) -> Self {
        Self {
            levels: levels.max(2),
            sequence: 0,
        }
    }

    pub fn scale(&mut self, frame: &DensityFrame) -> ColoredFrame {
        self.sequence += 1;

        let mut distinct: Vec<u32> = frame.counts.iter().copied().filter(|&c| c > 0).collect();
        let occupied = distinct.len();
        distinct.sort_unstable();
        let p90_density = if occupied == 0 {
            0
        } else {
            distinct[((occupied - 1) as f64 * 0.9).round() as usize]
        };
        distinct.dedup();

        // Level 0 is reserved for empty cells.
        let top = (self.levels - 1) as usize;
        let ranks = distinct.len();
        let cells: Vec<u8> = frame
            .counts
            .iter()
            .map(|&count| {
                if count == 0 {
                    return 0;
                }
                let rank = distinct.binary_search(&count).unwrap_or(0);
                if ranks <= 1 {
                    top as u8
                } else {
                    (1 + rank * (top - 1) / (ranks - 1)) as u8
                }
            })
            .collect();

        ColoredFrame {
            sequence: self.sequence,
            step: frame.step,
            cols: frame.cols,
            rows: frame.rows,
            levels: self.levels,
            cells: Arc::new(cells),
            summary: FrameSummary {
                boids: frame.total(),
                occupied,
                max_density: frame.max(),
                p90_density,
            },
        }
    }
}
