//! Configuration module for boidstream
//!
//! The whole application is described by one [`AppConfig`], stored as TOML.
//! Stage policies live under `[pipeline.<stage>]`; everything else is the
//! collaborators' settings.
//!
//! # Config Location
//!
//! Without `--config`, the file is looked up in the platform config dir:
//! - **Linux**: `~/.config/boidstream/config.toml`
//! - **macOS**: `~/Library/Application Support/boidstream/config.toml`
//! - **Windows**: `%APPDATA%\boidstream\config.toml`
//!
//! # Example
//!
//! ```ignore
//! use boidstream::config::AppConfig;
//!
//! let mut config = AppConfig::load_or_default(None);
//! config.simulation.particles = 1_000;
//! config.save("boidstream.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{BoidsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "boidstream";

/// Config filename inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Default config path in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Default directory for rolling log files
pub fn log_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .map(|p| p.join(APP_ID).join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

// ==================== App Config ====================

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Version for future migration support
    pub version: u32,

    pub simulation: SimulationSettings,
    pub render: RenderSettings,
    pub export: ExportSettings,
    pub pipeline: PipelineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            simulation: SimulationSettings::default(),
            render: RenderSettings::default(),
            export: ExportSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoidsError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| e.with_context(format!("Invalid config file {:?}", path)))
    }

    /// Load `path`, or the default location when `None`.
    ///
    /// A missing default file silently yields defaults; any other failure
    /// is logged and also yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) if p.exists() => p,
                _ => return Self::default(),
            },
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as pretty TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BoidsError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| BoidsError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Check collaborator settings.
    ///
    /// Stage policies are validated when the topology is built, where the
    /// pipeline reports them as configuration errors.
    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;
        if sim.particles == 0 {
            return Err(BoidsError::Config("simulation.particles must be > 0".into()));
        }
        if !(sim.world_width > 0.0 && sim.world_height > 0.0) {
            return Err(BoidsError::Config(format!(
                "simulation world must have a positive size, got {}x{}",
                sim.world_width, sim.world_height
            )));
        }
        if !(sim.dt > 0.0 && sim.dt.is_finite()) {
            return Err(BoidsError::Config(format!("simulation.dt must be > 0, got {}", sim.dt)));
        }
        if sim.min_speed < 0.0 || sim.max_speed < sim.min_speed {
            return Err(BoidsError::Config(format!(
                "simulation speeds must satisfy 0 <= min <= max, got {}..{}",
                sim.min_speed, sim.max_speed
            )));
        }
        if sim.perception_radius <= 0.0 || sim.separation_radius <= 0.0 {
            return Err(BoidsError::Config("simulation radii must be > 0".into()));
        }
        if self.render.color_levels < 2 {
            return Err(BoidsError::Config(format!(
                "render.color_levels must be >= 2, got {}",
                self.render.color_levels
            )));
        }
        let alpha = self.pipeline.metrics_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(BoidsError::Config(format!(
                "pipeline.metrics_alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        Ok(())
    }
}
