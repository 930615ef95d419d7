//! Test data builders for creating test objects

use boidstream::config::AppConfig;
use boidstream::pipeline::rate::Deadline;
use boidstream::pipeline::{StageBuffer, StageSpec};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builder for small, fast, reproducible configurations
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.simulation.particles = 60;
        config.simulation.seed = Some(42);
        config.render.show_status = false;
        config.pipeline.join_grace_ms = 300;
        Self { config }
    }

    pub fn particles(mut self, particles: usize) -> Self {
        self.config.simulation.particles = particles;
        self
    }

    pub fn watchdog_ms(mut self, millis: u64) -> Self {
        self.config.render.watchdog_ms = millis;
        self
    }

    pub fn export_to(mut self, path: &Path) -> Self {
        self.config.export.enabled = true;
        self.config.export.path = path.to_path_buf();
        self
    }

    /// Run every stage at `hz`.
    pub fn rate(mut self, hz: f64) -> Self {
        let p = &mut self.config.pipeline;
        for stage in [
            &mut p.simulate,
            &mut p.index,
            &mut p.rasterize,
            &mut p.autoscale,
            &mut p.render,
            &mut p.export,
        ] {
            stage.rate_hz = hz;
        }
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

/// A stage that publishes 1, 2, 3, ... into `out` every `period`.
pub fn counter_source(
    name: &str,
    out: &Arc<StageBuffer<u64>>,
    overwrite: bool,
    period: Duration,
) -> StageSpec<(), u64> {
    let mut n = 0u64;
    StageSpec::builder(name)
        .output(out, overwrite)
        .rate_limiter(Box::new(Deadline::new(period)))
        .evaluate(move |_, ()| {
            n += 1;
            n
        })
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new().particles(7).rate(50.0).build();
        assert_eq!(config.simulation.particles, 7);
        assert_eq!(config.pipeline.render.rate_hz, 50.0);
        assert!(config.validate().is_ok());
    }
}
