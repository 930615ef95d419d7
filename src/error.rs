//! Error handling for boidstream
//!
//! This module defines the crate-level error type and a Result alias used
//! outside the pipeline engine itself.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for boidstream operations
#[derive(Error, Debug)]
pub enum BoidsError {
    /// Errors raised while building or driving the pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the terminal backend
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BoidsError>,
    },
}

impl BoidsError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BoidsError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context layers
    pub fn root(&self) -> &BoidsError {
        match self {
            BoidsError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for BoidsError {
    fn from(err: serde_json::Error) -> Self {
        BoidsError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BoidsError {
    fn from(err: toml::de::Error) -> Self {
        BoidsError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for BoidsError {
    fn from(err: toml::ser::Error) -> Self {
        BoidsError::Serialization(err.to_string())
    }
}

/// Result type alias for boidstream operations
pub type Result<T> = std::result::Result<T, BoidsError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<BoidsError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
