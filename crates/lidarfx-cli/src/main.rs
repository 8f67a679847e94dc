//! `lidarfx` – replay a sensor recording through the perception pipeline.
//!
//! ```text
//! lidarfx [--config PATH] <recording.jsonl>
//! ```
//!
//! 1. Loads `~/.lidarfx/config.toml` (or `--config PATH`), writing the
//!    defaults on first run, then applies `LIDARFX_*` overrides.
//! 2. Initialises logging / trace export.
//! 3. Replays the recording: IMU records update the orientation, frames are
//!    levelled, cropped, and turned into described keypoints.
//! 4. Intercepts **Ctrl-C** to stop after the frame in flight.
//! 5. Prints a run summary.

mod config;

use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use lidarfx_middleware::{BusSink, EventBus, FrameSource, OutputSink, ReplaySource, Topic};
use lidarfx_perception::FramePipeline;
use lidarfx_runtime::{NodeSummary, PerceptionNode, init_tracing};
use lidarfx_types::EventPayload;

const USAGE: &str = "usage: lidarfx [--config PATH] <recording.jsonl>";

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    recording: PathBuf,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut config = None;
    let mut recording = None;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = it.next().ok_or("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Err(USAGE.to_string()),
            s if s.starts_with('-') => return Err(format!("unknown option {s}")),
            _ if recording.is_some() => return Err("only one recording may be given".into()),
            _ => recording = Some(PathBuf::from(arg)),
        }
    }
    let recording = recording.ok_or("missing recording path")?;
    Ok(Args { config, recording })
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e.red());
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("lidarfx");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let cfg = match config::load_or_init(&config_path) {
        Ok((cfg, created)) => {
            let verb = if created { "Wrote default config to" } else { "Config loaded from" };
            println!("  {} {}", verb, config_path.display().to_string().bold());
            cfg
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let pipeline = match cfg
        .to_pipeline_config()
        .and_then(|pc| FramePipeline::new(pc).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Invalid configuration".red(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(?cfg, "pipeline configured");

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping after the current frame …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; replay cannot be interrupted cleanly");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(replay(args.recording, pipeline, cfg.bus_capacity, stop_rx)) {
        Ok((summary, skipped)) => {
            print_summary(&summary, skipped);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Replay failed".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn replay(
    recording: PathBuf,
    pipeline: FramePipeline,
    bus_capacity: usize,
    stop: watch::Receiver<bool>,
) -> Result<(NodeSummary, usize), String> {
    let source = ReplaySource::open(&recording).await.map_err(|e| e.to_string())?;
    println!("  Replaying {}\n", recording.display().to_string().bold());

    let bus = Arc::new(EventBus::new(bus_capacity));
    let mut keypoints = bus.subscribe_to(Topic::Keypoints);
    let mut diagnostics = bus.subscribe_to(Topic::Diagnostics);

    // Per-frame console report.
    let reporter = tokio::spawn(async move {
        let (mut keypoints_open, mut diagnostics_open) = (true, true);
        while keypoints_open || diagnostics_open {
            tokio::select! {
                event = keypoints.next_event(), if keypoints_open => match event {
                    Some(event) => {
                        if let EventPayload::Keypoints(set) = event.payload {
                            println!(
                                "  {} {:>5} keypoints",
                                set.frame_id.dimmed(),
                                set.keypoints.len().to_string().bold()
                            );
                        }
                    }
                    None => keypoints_open = false,
                },
                event = diagnostics.next_event(), if diagnostics_open => match event {
                    Some(event) => {
                        if let EventPayload::FrameDropped { frame_id, reason } = event.payload {
                            println!("  {} {}: {}", "dropped".red(), frame_id, reason);
                        }
                    }
                    None => diagnostics_open = false,
                },
            }
        }
    });

    let sink: Arc<dyn OutputSink> = Arc::new(BusSink::new(Arc::clone(&bus)));
    let node = PerceptionNode::new(pipeline, sink);
    let summary = node.run_until(&source as &dyn FrameSource, stop).await;

    // Dropping the last bus handles closes the topics and ends the reporter.
    drop(node);
    drop(bus);
    if let Err(e) = reporter.await {
        warn!(error = %e, "report task failed");
    }
    Ok((summary, source.skipped_lines()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "lidarfx".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  LiDAR keypoint and descriptor extraction");
    println!();
}

fn print_summary(summary: &NodeSummary, skipped_lines: usize) {
    println!();
    println!("  {}", "Replay finished".green().bold());
    println!("    frames processed    {}", summary.frames_processed);
    println!("    keypoints emitted   {}", summary.keypoints_emitted);
    println!("    orientation samples {}", summary.orientation_updates);
    if summary.stale_frames > 0 {
        println!("    stale orientation   {}", summary.stale_frames.to_string().yellow());
    }
    if summary.frames_dropped > 0 {
        println!("    frames dropped      {}", summary.frames_dropped.to_string().red());
    }
    if skipped_lines > 0 {
        println!("    malformed lines     {}", skipped_lines.to_string().yellow());
    }
    println!();
}
