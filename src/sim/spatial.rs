//! Uniform-grid spatial index over a wrapping 2D world.
//!
//! Built with a counting sort: `cell_start[c]..cell_start[c + 1]` is the
//! range of `entries` holding the boid indices of cell `c`.

use super::{wrap_delta, Boid};
use glam::Vec2;

#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    /// Simulation step the index was built from
    pub step: u64,
    cell_size: f32,
    cols: usize,
    rows: usize,
    world: Vec2,
    cell_start: Vec<u32>,
    entries: Vec<u32>,
}

impl SpatialIndex {
    pub fn build(boids: &[Boid], world: Vec2, cell_size: f32, step: u64) -> Self {
        let cols = ((world.x / cell_size).floor() as usize).max(1);
        let rows = ((world.y / cell_size).floor() as usize).max(1);
        let mut index = Self {
            step,
            cell_size,
            cols,
            rows,
            world,
            cell_start: vec![0; cols * rows + 1],
            entries: vec![0; boids.len()],
        };

        let cells: Vec<usize> = boids.iter().map(|b| index.cell_of(b.pos)).collect();
        for &c in &cells {
            index.cell_start[c + 1] += 1;
        }
        for c in 0..cols * rows {
            index.cell_start[c + 1] += index.cell_start[c];
        }
        let mut fill = index.cell_start.clone();
        for (i, &c) in cells.iter().enumerate() {
            index.entries[fill[c] as usize] = i as u32;
            fill[c] += 1;
        }
        index
    }

    /// Number of boids indexed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    fn cell_coords(&self, pos: Vec2) -> (usize, usize) {
        let cx = ((pos.x / self.cell_size) as isize).clamp(0, self.cols as isize - 1);
        let cy = ((pos.y / self.cell_size) as isize).clamp(0, self.rows as isize - 1);
        (cx as usize, cy as usize)
    }

    fn cell_of(&self, pos: Vec2) -> usize {
        let (cx, cy) = self.cell_coords(pos);
        cy * self.cols + cx
    }

    /// Call `visit(index, offset)` for every indexed boid within `radius` of
    /// `pos`, where `offset` is the shortest wrapped vector from `pos`.
    pub fn for_each_neighbor(&self, boids: &[Boid], pos: Vec2, radius: f32, mut visit: impl FnMut(usize, Vec2)) {
        if self.entries.is_empty() {
            return;
        }
        let reach = (radius / self.cell_size).ceil() as isize;
        let (cx, cy) = self.cell_coords(pos);
        let span_x = (2 * reach + 1).min(self.cols as isize);
        let span_y = (2 * reach + 1).min(self.rows as isize);
        let r2 = radius * radius;

        for dy in 0..span_y {
            let y = (cy as isize + dy - reach).rem_euclid(self.rows as isize) as usize;
            for dx in 0..span_x {
                let x = (cx as isize + dx - reach).rem_euclid(self.cols as isize) as usize;
                let c = y * self.cols + x;
                let range = self.cell_start[c] as usize..self.cell_start[c + 1] as usize;
                for &i in &self.entries[range] {
                    let Some(other) = boids.get(i as usize) else {
                        continue;
                    };
                    let offset = wrap_delta(other.pos - pos, self.world);
                    if offset.length_squared() <= r2 {
                        visit(i as usize, offset);
                    }
                }
            }
        }
    }
}
