//! CLI entry point for Revive Pixels
//!
//! Expands the given inputs into video files, upscales them one at a time and
//! prints `Success: <path>` or `Failed: <reason>` for each.

use clap::Parser;
use revive_pixels::{
    collect_inputs, Config, JobOutcome, JobReport, TracingProgress, UpscaleRequest,
    UpscaleService, DEFAULT_MODEL, METRICS_ADDR,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Revive Pixels - batched AI video upscaling with realesrgan-ncnn-vulkan
#[derive(Parser, Debug)]
#[command(name = "revive-pixels")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files or directories to upscale
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Path to a TOML configuration file (defaults plus environment otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upscaling model
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Upscale factor (must be supported by the model)
    #[arg(short, long, default_value_t = 4)]
    scale: u32,

    /// Upscaler tile size (0 = auto)
    #[arg(long, default_value_t = 0)]
    tile_size: u32,

    /// Output frame rate (0 = same as source)
    #[arg(long, default_value_t = 0)]
    fps: u32,

    /// Directory for upscaled videos
    #[arg(short, long, default_value = "output_videos")]
    output_dir: PathBuf,

    /// Write a JSON map of input path to result
    #[arg(long)]
    report: Option<PathBuf>,

    /// Serve metrics on http://127.0.0.1:7878/metrics while running
    #[arg(long, default_value = "false")]
    metrics: bool,

    /// Skip startup checks (ffmpeg version, tool availability)
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path)
            .map_err(|e| format!("Failed to load config {}: {}", path.display(), e)),
        None => Config::from_env().map_err(|e| format!("Invalid configuration: {}", e)),
    }
}

fn write_report(path: &Path, reports: &[JobReport]) -> Result<(), String> {
    let map: BTreeMap<String, String> = reports
        .iter()
        .map(|r| (r.input.display().to_string(), r.outcome.to_string()))
        .collect();
    let json = serde_json::to_string_pretty(&map).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let service = UpscaleService::new(config, Arc::new(TracingProgress));
    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    }
    if let Err(e) = service.prepare(!args.skip_checks) {
        error!("Startup failed: {}", e);
        return ExitCode::FAILURE;
    }
    info!(
        "Upscaling with {} concurrent upscaler processes ({} cores)",
        service.plan().upscale_workers,
        service.plan().total_cores
    );

    if args.metrics {
        let _metrics_tasks = service.serve_metrics(SocketAddr::from(METRICS_ADDR));
    }

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running job");
            cancel.cancel();
        }
    });

    let inputs = collect_inputs(&args.inputs, Some(&args.output_dir));
    if inputs.is_empty() {
        error!("No video files found in the given inputs");
        return ExitCode::FAILURE;
    }

    let request = UpscaleRequest {
        model: args.model,
        scale: args.scale,
        tile_size: args.tile_size,
        target_fps: args.fps,
    };

    let mut reports = Vec::with_capacity(inputs.len());
    let mut jobs = Vec::new();
    for input in &inputs {
        match service.submit(input, &request, &args.output_dir) {
            Ok(job) => jobs.push(job),
            Err(e) => reports.push(JobReport {
                input: input.clone(),
                outcome: JobOutcome::Failed(e.to_string()),
            }),
        }
    }
    reports.extend(service.run_jobs(jobs).await);

    for report in &reports {
        println!("{}: {}", report.input.display(), report.outcome);
    }

    if let Some(path) = &args.report {
        if let Err(e) = write_report(path, &reports) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    if reports.iter().all(|r| r.outcome.is_success()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
