//! Boids flocking simulation on a wrapping 2D world.
//!
//! The simulation itself is single-threaded and pure apart from its RNG;
//! the pipeline drives it once per `simulate` cycle and publishes the
//! resulting [`Flock`] snapshot.
//!
//! Rules, applied per boid against neighbours found through the
//! [`SpatialIndex`]:
//! - **Separate**: push away from boids inside `separation_radius`
//! - **Align**: steer toward the mean neighbour velocity
//! - **Cohere**: steer toward the mean neighbour position
//! - **Speed limit** and toroidal wrap

pub mod spatial;

pub use spatial::SpatialIndex;

use crate::config::SimulationSettings;
use glam::Vec2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Boid {
    pub pos: Vec2,
    pub vel: Vec2,
}

/// Immutable snapshot published by the simulate stage.
#[derive(Debug, Clone, Default)]
pub struct Flock {
    pub step: u64,
    pub world: Vec2,
    pub boids: Arc<Vec<Boid>>,
}

impl Flock {
    pub fn len(&self) -> usize {
        self.boids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boids.is_empty()
    }
}

/// Shortest vector equivalent to `d` on a torus of size `world`.
pub fn wrap_delta(d: Vec2, world: Vec2) -> Vec2 {
    d - world * (d / world).round()
}

/// Wrap a position into `[0, world)`.
pub fn wrap_position(p: Vec2, world: Vec2) -> Vec2 {
    Vec2::new(p.x.rem_euclid(world.x), p.y.rem_euclid(world.y))
}

/// Neighbour sums gathered for one boid.
#[derive(Default)]
struct Neighborhood {
    separation: Vec2,
    offset_sum: Vec2,
    vel_sum: Vec2,
    count: u32,
}

pub struct Simulation {
    settings: SimulationSettings,
    world: Vec2,
    rng: SmallRng,
    boids: Vec<Boid>,
    step: u64,
    brute_force_steps: u64,
}

impl Simulation {
    pub fn new(settings: &SimulationSettings) -> Self {
        let mut rng = match settings.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let world = Vec2::new(settings.world_width, settings.world_height);
        let speed = (settings.min_speed + settings.max_speed) * 0.5;
        let boids = (0..settings.particles)
            .map(|_| {
                let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                Boid {
                    pos: Vec2::new(rng.gen_range(0.0..world.x), rng.gen_range(0.0..world.y)),
                    vel: Vec2::from_angle(angle) * speed,
                }
            })
            .collect();
        Self {
            settings: settings.clone(),
            world,
            rng,
            boids,
            step: 0,
            brute_force_steps: 0,
        }
    }

    pub fn world(&self) -> Vec2 {
        self.world
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Steps that could not use the index because it did not match the flock.
    pub fn brute_force_steps(&self) -> u64 {
        self.brute_force_steps
    }

    /// Current state without advancing.
    pub fn snapshot(&self) -> Flock {
        Flock {
            step: self.step,
            world: self.world,
            boids: Arc::new(self.boids.clone()),
        }
    }

    /// Neighbour cell size the index should be built with.
    pub fn cell_size(&self) -> f32 {
        self.settings.perception_radius
    }

    /// Advance one step using `index` for neighbour queries.
    ///
    /// The index may lag the flock by a few steps; it is only used to find
    /// candidates, distances always come from current positions. An index
    /// built for a different flock size is ignored.
    pub fn advance(&mut self, index: &SpatialIndex) -> Flock {
        let use_index = index.len() == self.boids.len() && !index.is_empty();
        if !use_index {
            self.brute_force_steps += 1;
        }

        let s = &self.settings;
        let radius = s.perception_radius.max(s.separation_radius);
        let mut accel = vec![Vec2::ZERO; self.boids.len()];

        for (i, boid) in self.boids.iter().enumerate() {
            let mut hood = Neighborhood::default();
            let mut visit = |j: usize, _: Vec2| {
                if j == i {
                    return;
                }
                let Some(other) = self.boids.get(j) else {
                    return;
                };
                let offset = wrap_delta(other.pos - boid.pos, self.world);
                let dist = offset.length();
                if dist > radius {
                    return;
                }
                if dist < s.separation_radius && dist > 1e-4 {
                    hood.separation -= offset / dist * (1.0 - dist / s.separation_radius);
                }
                if dist < s.perception_radius {
                    hood.offset_sum += offset;
                    hood.vel_sum += other.vel;
                    hood.count += 1;
                }
            };
            if use_index {
                index.for_each_neighbor(&self.boids, boid.pos, radius, &mut visit);
            } else {
                for j in 0..self.boids.len() {
                    visit(j, Vec2::ZERO);
                }
            }

            let mut a = hood.separation * s.separation_weight;
            if hood.count > 0 {
                let n = hood.count as f32;
                a += (hood.vel_sum / n - boid.vel) * s.alignment_weight;
                a += (hood.offset_sum / n) * s.cohesion_weight;
            }
            accel[i] = a;
        }

        let dt = s.dt;
        let (min_speed, max_speed) = (s.min_speed, s.max_speed);
        for (boid, a) in self.boids.iter_mut().zip(accel) {
            let jitter = Vec2::new(self.rng.gen_range(-1.0..1.0), self.rng.gen_range(-1.0..1.0));
            let mut vel = boid.vel + (a + jitter) * dt;
            let speed = vel.length();
            if speed > max_speed {
                vel *= max_speed / speed;
            } else if speed < min_speed {
                vel = if speed > 1e-6 {
                    vel * (min_speed / speed)
                } else {
                    Vec2::X * min_speed
                };
            }
            boid.vel = vel;
            boid.pos = wrap_position(boid.pos + vel * dt, self.world);
        }

        self.step += 1;
        self.snapshot()
    }
}
