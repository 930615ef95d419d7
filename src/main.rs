//! boidstream - Main Entry Point
//!
//! Runs the boids pipeline in the terminal (default) or headless, then
//! prints a per-stage run summary.

use anyhow::{Context, Result};
use boidstream::{
    app::{build_pipeline, BoidsPipeline},
    config::{self, AppConfig, RenderSettings},
    pipeline::RunSummary,
    render::{HeadlessSink, TerminalSink},
};
use clap::Parser;
use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Headless runs without --frames or --duration-secs stop after this long.
const DEFAULT_HEADLESS_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Parser, Clone)]
#[command(name = "boidstream")]
#[command(about = "Boids flocking simulation on a concurrent staged pipeline")]
struct Cli {
    /// Config file (TOML). Defaults to the platform config dir.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this path and exit.
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Number of boids.
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    /// RNG seed for a reproducible flock.
    #[arg(long)]
    seed: Option<u64>,

    /// Run without drawing; frames are only counted.
    #[arg(long)]
    headless: bool,

    /// Stop after this many distinct frames (headless only).
    #[arg(long)]
    frames: Option<u64>,

    /// Stop after this many seconds.
    #[arg(long)]
    duration_secs: Option<f64>,

    /// Export frame summaries as JSON lines to this file.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Log to stderr instead of a rolling file.
    #[arg(long)]
    log_stderr: bool,

    /// Directory for rolling log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(particles) = self.particles {
            config.simulation.particles = particles;
        }
        if let Some(seed) = self.seed {
            config.simulation.seed = Some(seed);
        }
        if let Some(path) = &self.export {
            config.export.enabled = true;
            config.export.path = path.clone();
        }
    }

    fn duration_limit(&self) -> Result<Option<Duration>> {
        self.duration_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid --duration-secs {}", secs))
            })
            .transpose()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli)?;

    let mut config = AppConfig::load_or_default(cli.config.as_deref());
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    if let Some(path) = &cli.write_config {
        config
            .save(path)
            .with_context(|| format!("write config to {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    tracing::info!(
        "Starting boidstream: {} boids, {}",
        config.simulation.particles,
        if cli.headless { "headless" } else { "terminal" }
    );

    let summary = if cli.headless {
        run_headless(&cli, &config)?
    } else {
        run_terminal(&cli, &config)?
    };
    print_summary(&summary);
    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,boidstream=debug"));

    if cli.log_stderr {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()?;
        return Ok(None);
    }

    let dir = cli.log_dir.clone().unwrap_or_else(config::log_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(&dir, "boidstream.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()?;
    Ok(Some(guard))
}

fn run_headless(cli: &Cli, config: &AppConfig) -> Result<RunSummary> {
    let raster = config.render.raster_size(RenderSettings::FALLBACK_SIZE);
    let sink = HeadlessSink::new(100);
    let frames = sink.counter();
    let mut pipeline = build_pipeline(config, raster, Box::new(sink))?;

    let duration = match (cli.frames, cli.duration_limit()?) {
        (None, None) => Some(DEFAULT_HEADLESS_DURATION),
        (_, duration) => duration,
    };
    let started = Instant::now();
    pipeline.start()?;
    loop {
        std::thread::sleep(Duration::from_millis(20));
        if cli.frames.is_some_and(|n| frames.distinct() >= n) {
            break;
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }
    pipeline.stop();
    tracing::info!(
        "Headless run finished: {} distinct frames, {} presented",
        frames.distinct(),
        frames.presented()
    );
    Ok(pipeline.engine.summary())
}

fn run_terminal(cli: &Cli, config: &AppConfig) -> Result<RunSummary> {
    let area = crossterm::terminal::size().unwrap_or(RenderSettings::FALLBACK_SIZE);
    let raster = config.render.raster_size(area);
    let sink = TerminalSink::new(config.render.color_levels, area.0);
    let mut pipeline = build_pipeline(config, raster, Box::new(sink))?;

    init_terminal()?;
    let run_result = run_key_loop(&mut pipeline, cli.duration_limit()?);
    pipeline.stop();
    let restore_result = restore_terminal();
    run_result?;
    restore_result?;
    Ok(pipeline.engine.summary())
}

fn init_terminal() -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    execute!(io::stdout(), EnterAlternateScreen, Hide)?;
    Ok(())
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, Show)?;
    Ok(())
}

fn is_quit(key: &KeyEvent) -> bool {
    matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
        || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
}

fn run_key_loop(pipeline: &mut BoidsPipeline, duration: Option<Duration>) -> Result<()> {
    let started = Instant::now();
    pipeline.start()?;
    loop {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            return Ok(());
        }
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if is_quit(&key) {
                return Ok(());
            }
            if key.code == KeyCode::Char(' ') {
                let state = pipeline.toggle_pause()?;
                tracing::info!("Engine {}", state.label());
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Run: {:.2}s (started {})",
        summary.duration_secs.unwrap_or_default(),
        summary
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "{:<10} {:>9} {:>8} {:>10} {:>10} {:>7} {:>9}",
        "stage", "cycles", "rate Hz", "compute ms", "iter ms", "stall %", "published"
    );
    for s in &summary.stages {
        println!(
            "{:<10} {:>9} {:>8.1} {:>10.2} {:>10.2} {:>7.1} {:>9}",
            s.name,
            s.completed,
            s.effective_rate_hz,
            s.avg_compute_us / 1000.0,
            s.avg_iteration_us / 1000.0,
            s.stall_rate(),
            s.publishes
        );
    }
    for b in &summary.buffers {
        println!(
            "buffer {:<10} capacity {} enqueued {} dequeued {} overwritten {}",
            b.name, b.capacity, b.total_enqueues, b.total_dequeues, b.total_overwrites
        );
    }
}
