//! Rasterize a flock into a per-cell density grid.

use crate::sim::Flock;
use std::sync::Arc;

/// Boid counts per terminal cell, row-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensityFrame {
    /// Simulation step the frame was rasterized from
    pub step: u64,
    pub cols: u16,
    pub rows: u16,
    pub counts: Arc<Vec<u32>>,
}

impl DensityFrame {
    pub fn get(&self, col: u16, row: u16) -> u32 {
        self.counts
            .get(row as usize * self.cols as usize + col as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn max(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    pub fn occupied(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

/// Count boids per cell of a `cols x rows` grid covering the whole world.
pub fn rasterize(flock: &Flock, cols: u16, rows: u16) -> DensityFrame {
    let (cols, rows) = (cols.max(1), rows.max(1));
    let mut counts = vec![0u32; cols as usize * rows as usize];
    if flock.world.x > 0.0 && flock.world.y > 0.0 {
        let sx = cols as f32 / flock.world.x;
        let sy = rows as f32 / flock.world.y;
        for boid in flock.boids.iter() {
            let c = ((boid.pos.x * sx) as usize).min(cols as usize - 1);
            let r = ((boid.pos.y * sy) as usize).min(rows as usize - 1);
            counts[r * cols as usize + c] += 1;
        }
    }
    DensityFrame {
        step: flock.step,
        cols,
        rows,
        counts: Arc::new(counts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Boid;
    use glam::Vec2;

    fn flock(points: &[(f32, f32)]) -> Flock {
        Flock {
            step: 9,
            world: Vec2::new(10.0, 10.0),
            boids: Arc::new(
                points
                    .iter()
                    .map(|&(x, y)| Boid {
                        pos: Vec2::new(x, y),
                        vel: Vec2::ZERO,
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_counts_every_boid_once() {
        let frame = rasterize(&flock(&[(0.1, 0.1), (0.2, 0.3), (9.9, 9.9), (5.0, 2.0)]), 5, 5);
        assert_eq!(frame.step, 9);
        assert_eq!(frame.total(), 4);
        assert_eq!(frame.get(0, 0), 2);
        assert_eq!(frame.get(4, 4), 1);
        assert_eq!(frame.get(2, 1), 1);
        assert_eq!(frame.max(), 2);
        assert_eq!(frame.occupied(), 3);
    }

    #[test]
    fn test_empty_flock_and_degenerate_grid() {
        let frame = rasterize(&Flock::default(), 0, 0);
        assert_eq!((frame.cols, frame.rows), (1, 1));
        assert_eq!(frame.total(), 0);
        assert_eq!(frame.get(3, 3), 0);
    }
}
