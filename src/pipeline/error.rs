//! Pipeline-specific error types.
//!
//! Only construction-time configuration problems and lifecycle misuse are
//! reported as errors. Timeouts and stalls are never errors; they degrade
//! reads or show up in [`StageStats`](crate::pipeline::StageStats).

use crate::pipeline::id::StageId;
use thiserror::Error;

/// Errors that can occur while building or driving a pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Buffer '{buffer}': invalid capacity {capacity}")]
    InvalidCapacity { buffer: String, capacity: i64 },

    #[error("Binding on '{buffer}': reuse count must be positive, got {count}")]
    InvalidReuseCount { buffer: String, count: i64 },

    #[error("Binding on '{buffer}': reuse tolerance must be positive, got {tolerance}")]
    InvalidReuseTolerance { buffer: String, tolerance: i64 },

    #[error("{context}: invalid timeout {millis}ms")]
    InvalidTimeout { context: String, millis: i64 },

    #[error("Stage '{stage}': invalid rate {hz} Hz")]
    InvalidRate { stage: String, hz: f64 },

    #[error("Buffer '{0}' is already defined")]
    DuplicateBuffer(String),

    #[error("Stage '{0}' is already defined")]
    DuplicateStage(String),

    #[error("Buffer '{buffer}' already has writer '{writer}'")]
    WriterAlreadyBound { buffer: String, writer: String },

    #[error("Stage '{stage}' expects {expected} inputs, got {actual}")]
    InputCountMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("Stage '{stage}' references buffer '{buffer}' not owned by this engine")]
    UnknownBuffer { stage: String, buffer: String },

    #[error("Unknown stage {0}")]
    UnknownStage(StageId),

    #[error("Cannot {op} while {state}")]
    InvalidState { state: &'static str, op: &'static str },

    #[error("Failed to spawn thread for '{stage}': {message}")]
    ThreadSpawn { stage: String, message: String },

    #[error("Buffer closed")]
    Closed,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Marker returned by blocking buffer operations once the buffer is closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("buffer closed")]
pub struct Closed;

impl From<Closed> for PipelineError {
    fn from(_: Closed) -> Self {
        PipelineError::Closed
    }
}
