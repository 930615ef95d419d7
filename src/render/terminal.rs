//! Frame sinks: the crossterm terminal and a headless counter.
//!
//! The render stage owns a [`FrameRenderer`], which keeps the "no update"
//! watchdog and status line and hands finished frames to a [`FrameSink`].

use super::autoscale::ColoredFrame;
use crate::error::{BoidsError, Result};
use crate::pipeline::{MetricsRegistry, StageStats};
use crossterm::cursor::MoveTo;
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use crossterm::{queue, QueueableCommand};
use std::io::{Stdout, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What is drawn on top of / under the raster.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub paused: bool,
    /// Set once the watchdog fired: time since the last fresh frame
    pub no_update_for: Option<Duration>,
    /// Empty when the status line is disabled
    pub status: Vec<StageStats>,
}

/// Destination of rendered frames.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send {
    fn present(&mut self, frame: &ColoredFrame, overlay: &Overlay) -> Result<()>;
}

/// Fires once no fresh frame has been seen for `limit`.
#[derive(Debug, Clone)]
pub struct Watchdog {
    limit: Duration,
    last_fresh: Instant,
}

impl Watchdog {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last_fresh: Instant::now(),
        }
    }

    /// Record one render cycle; returns the staleness once past the limit.
    pub fn observe(&mut self, fresh: bool) -> Option<Duration> {
        let now = Instant::now();
        if fresh {
            self.last_fresh = now;
            return None;
        }
        let elapsed = now.duration_since(self.last_fresh);
        (elapsed >= self.limit).then_some(elapsed)
    }
}

/// Per-cycle draw logic of the render stage.
pub struct FrameRenderer {
    sink: Box<dyn FrameSink>,
    watchdog: Watchdog,
    metrics: Option<Arc<MetricsRegistry>>,
    paused: Arc<AtomicBool>,
    failures: u64,
}

impl FrameRenderer {
    pub fn new(sink: Box<dyn FrameSink>, watchdog: Duration, paused: Arc<AtomicBool>) -> Self {
        Self {
            sink,
            watchdog: Watchdog::new(watchdog),
            metrics: None,
            paused,
            failures: 0,
        }
    }

    /// Show a status line built from `metrics`.
    pub fn with_status(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Draw `frame`. Sink failures are logged, never propagated, so the
    /// stage keeps running.
    pub fn draw(&mut self, fresh: bool, frame: &ColoredFrame) {
        let overlay = Overlay {
            paused: self.paused.load(Ordering::Relaxed),
            no_update_for: self.watchdog.observe(fresh),
            status: self.metrics.as_ref().map(|m| m.snapshot()).unwrap_or_default(),
        };
        if let Err(e) = self.sink.present(frame, &overlay) {
            self.failures += 1;
            if self.failures == 1 || self.failures % 100 == 0 {
                tracing::warn!("Frame sink failed ({} total): {}", self.failures, e);
            }
        }
    }
}

/// One status-line entry per stage, truncated to `width` characters.
pub fn format_status(stats: &[StageStats], paused: bool, width: usize) -> String {
    let mut line = String::new();
    if paused {
        line.push_str("[PAUSED] ");
    }
    let entries: Vec<String> = stats
        .iter()
        .map(|s| {
            let mut entry = format!(
                "{} {:.0}Hz {:.1}ms",
                s.name,
                s.effective_rate_hz,
                s.avg_compute_us / 1000.0
            );
            if s.stalls > 0 {
                entry.push_str(&format!(" stall {:.0}%", s.stall_rate()));
            }
            entry
        })
        .collect();
    line.push_str(&entries.join(" | "));
    line.chars().take(width).collect()
}

/// Background colors for each level; level 0 keeps the terminal background.
pub fn palette(levels: u8) -> Vec<Color> {
    let levels = levels.max(2) as usize;
    let mut colors = Vec::with_capacity(levels);
    colors.push(Color::Reset);
    for i in 1..levels {
        let t = (i - 1) as f32 / (levels - 2).max(1) as f32;
        // Dark blue to warm yellow.
        let r = (20.0 + t * 235.0) as u8;
        let g = (40.0 + t * 180.0) as u8;
        let b = (140.0 - t * 120.0) as u8;
        colors.push(Color::Rgb { r, g, b });
    }
    colors
}

/// Draws frames as colored cells on stdout. Expects raw mode and the
/// alternate screen to be set up by the caller.
pub struct TerminalSink {
    out: Stdout,
    palette: Vec<Color>,
    width: u16,
}

impl TerminalSink {
    pub fn new(levels: u8, width: u16) -> Self {
        Self {
            out: std::io::stdout(),
            palette: palette(levels),
            width,
        }
    }

    fn draw_raster(&mut self, frame: &ColoredFrame) -> std::io::Result<()> {
        for row in 0..frame.rows {
            self.out.queue(MoveTo(0, row))?;
            let mut current = None;
            for col in 0..frame.cols {
                let color = self
                    .palette
                    .get(frame.level(col, row) as usize)
                    .copied()
                    .unwrap_or(Color::Reset);
                if current != Some(color) {
                    self.out.queue(SetBackgroundColor(color))?;
                    current = Some(color);
                }
                self.out.queue(Print(' '))?;
            }
        }
        self.out.queue(ResetColor)?;
        Ok(())
    }

    fn draw_banner(&mut self, frame: &ColoredFrame, stale: Duration) -> std::io::Result<()> {
        let text = format!(" NO UPDATE {:.1}s ", stale.as_secs_f64());
        let col = (frame.cols as usize).saturating_sub(text.len()) / 2;
        queue!(
            self.out,
            MoveTo(col as u16, frame.rows / 2),
            SetBackgroundColor(Color::DarkRed),
            SetForegroundColor(Color::White),
            Print(text),
            ResetColor
        )
    }

    fn draw_status(&mut self, frame: &ColoredFrame, overlay: &Overlay) -> std::io::Result<()> {
        let width = self.width.max(frame.cols) as usize;
        let summary = format!(
            "frame {} step {} boids {} occupied {} max {}{}",
            frame.sequence,
            frame.step,
            frame.summary.boids,
            frame.summary.occupied,
            frame.summary.max_density,
            if overlay.paused { "  [space] resume [q] quit" } else { "  [space] pause [q] quit" }
        );
        let stages = format_status(&overlay.status, overlay.paused, width);
        queue!(
            self.out,
            MoveTo(0, frame.rows),
            Clear(ClearType::CurrentLine),
            Print(summary.chars().take(width).collect::<String>()),
            MoveTo(0, frame.rows + 1),
            Clear(ClearType::CurrentLine),
            Print(stages)
        )
    }
}

impl FrameSink for TerminalSink {
    fn present(&mut self, frame: &ColoredFrame, overlay: &Overlay) -> Result<()> {
        let result = (|| {
            self.draw_raster(frame)?;
            if let Some(stale) = overlay.no_update_for {
                self.draw_banner(frame, stale)?;
            }
            if !overlay.status.is_empty() {
                self.draw_status(frame, overlay)?;
            }
            self.out.flush()
        })();
        result.map_err(|e| BoidsError::Terminal(e.to_string()))
    }
}

/// Counters shared between a [`HeadlessSink`] and whoever watches it.
#[derive(Debug, Default)]
pub struct FrameCounter {
    presented: AtomicU64,
    distinct: AtomicU64,
    last_sequence: AtomicU64,
    watchdog_fired: AtomicU64,
}

impl FrameCounter {
    /// Present calls, fresh or not.
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Acquire)
    }

    /// Frames with a sequence number not seen before.
    pub fn distinct(&self) -> u64 {
        self.distinct.load(Ordering::Acquire)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn watchdog_fired(&self) -> u64 {
        self.watchdog_fired.load(Ordering::Acquire)
    }
}

/// Sink that only counts frames, for `--headless` runs and tests.
#[derive(Debug, Default)]
pub struct HeadlessSink {
    counter: Arc<FrameCounter>,
    log_every: u64,
}

impl HeadlessSink {
    pub fn new(log_every: u64) -> Self {
        Self {
            counter: Arc::new(FrameCounter::default()),
            log_every,
        }
    }

    pub fn counter(&self) -> Arc<FrameCounter> {
        self.counter.clone()
    }
}

impl FrameSink for HeadlessSink {
    fn present(&mut self, frame: &ColoredFrame, overlay: &Overlay) -> Result<()> {
        let c = &self.counter;
        c.presented.fetch_add(1, Ordering::AcqRel);
        if overlay.no_update_for.is_some() {
            c.watchdog_fired.fetch_add(1, Ordering::AcqRel);
        }
        if frame.sequence != 0 && frame.sequence != c.last_sequence.load(Ordering::Acquire) {
            c.last_sequence.store(frame.sequence, Ordering::Release);
            let distinct = c.distinct.fetch_add(1, Ordering::AcqRel) + 1;
            if self.log_every > 0 && distinct % self.log_every == 0 {
                tracing::debug!(
                    "Frame {} (step {}): {} boids over {} cells",
                    frame.sequence,
                    frame.step,
                    frame.summary.boids,
                    frame.summary.occupied
                );
            }
        }
        Ok(())
    }
}
