//! JSON-lines export of frame summaries.

use super::autoscale::{ColoredFrame, FrameSummary};
use crate::config::ExportSettings;
use crate::error::{BoidsError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One line of the export file.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub sequence: u64,
    pub step: u64,
    pub wall_time: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: FrameSummary,
}

impl FrameRecord {
    pub fn from_frame(frame: &ColoredFrame) -> Self {
        Self {
            sequence: frame.sequence,
            step: frame.step,
            wall_time: Utc::now(),
            summary: frame.summary,
        }
    }
}

pub struct FrameExporter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    last_sequence: u64,
}

impl FrameExporter {
    pub fn open(settings: &ExportSettings) -> Result<Self> {
        Self::open_path(&settings.path, settings.append)
    }

    pub fn open_path(path: &Path, append: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| BoidsError::from(e).with_context(format!("Failed to open export file {:?}", path)))?;
        tracing::info!("Exporting frame summaries to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            written: 0,
            last_sequence: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `frame` unless it was already written. Returns whether a line
    /// was written.
    pub fn write(&mut self, frame: &ColoredFrame) -> Result<bool> {
        if frame.sequence == 0 || frame.sequence == self.last_sequence {
            return Ok(false);
        }
        let line = serde_json::to_string(&FrameRecord::from_frame(frame))?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        self.last_sequence = frame.sequence;
        self.written += 1;
        Ok(true)
    }
}
