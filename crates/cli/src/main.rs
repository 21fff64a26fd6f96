//! CLI entry point for Movie Normalizer
//!
//! Loads configuration, runs startup checks, normalizes one movie and maps
//! the outcome to the process exit code.

use clap::Parser;
use movie_normalizer::{
    default_output_path, run_startup_checks, Config, FfmpegToolkit, PipelineCoordinator,
    PipelineOutcome, TargetCodec,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Movie Normalizer - per-stream EBU R128 loudness normalization for movie files
#[derive(Parser, Debug)]
#[command(name = "movie-normalizer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input media container
    input: PathBuf,

    /// Output path (default: <stem>.normalized.<ext> next to the input)
    output: Option<PathBuf>,

    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target integrated loudness in LUFS
    #[arg(long, allow_negative_numbers = true)]
    target_lufs: Option<f64>,

    /// True-peak ceiling in dBTP
    #[arg(long, allow_negative_numbers = true)]
    true_peak: Option<f64>,

    /// Loudness tolerance in LU within which streams are copied unchanged
    #[arg(long)]
    tolerance: Option<f64>,

    /// Target codec for re-encoded streams (opus, aac, flac, ac3)
    #[arg(long)]
    codec: Option<TargetCodec>,

    /// Bitrate for re-encoded streams in kbit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Fold surround streams down to stereo
    #[arg(long)]
    downmix_stereo: bool,

    /// Maximum number of audio streams processed at once
    #[arg(short, long)]
    jobs: Option<u32>,

    /// Base directory for temporary artifacts
    #[arg(short, long)]
    temp_dir: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe, encoder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of file and environment values.
    fn apply(&self, cfg: &mut Config) {
        if let Some(v) = self.target_lufs {
            cfg.target.integrated_lufs = v;
        }
        if let Some(v) = self.true_peak {
            cfg.target.true_peak_dbtp = v;
        }
        if let Some(v) = self.tolerance {
            cfg.target.tolerance_lu = v;
        }
        if let Some(codec) = self.codec {
            cfg.encoder.codec = codec;
        }
        if let Some(kbps) = self.bitrate {
            cfg.encoder.bitrate_kbps = Some(kbps);
        }
        if self.downmix_stereo {
            cfg.encoder.downmix_stereo = true;
        }
        if let Some(jobs) = self.jobs {
            cfg.concurrency.max_parallel_streams = jobs;
        }
        if let Some(dir) = &self.temp_dir {
            cfg.tools.temp_dir = Some(dir.clone());
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env(),
    };
    args.apply(&mut config);

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup checks failed");
        return ExitCode::FAILURE;
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input));

    let toolkit = Arc::new(FfmpegToolkit::from_config(&config.tools));
    let coordinator = PipelineCoordinator::from_config(toolkit, &config);
    info!(
        input = %args.input.display(),
        output = %output.display(),
        target_lufs = coordinator.profile().integrated_lufs,
        true_peak_dbtp = coordinator.profile().true_peak_dbtp,
        codec = %coordinator.profile().codec,
        max_parallel_streams = coordinator.workers().max_parallel_streams,
        "normalizing"
    );

    // Dropping the run future on Ctrl-C kills child processes and removes temp artifacts
    let outcome = tokio::select! {
        outcome = coordinator.run(&args.input, &output) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, aborting run");
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        PipelineOutcome::Success(path) => {
            info!(output = %path.display(), "done");
            ExitCode::SUCCESS
        }
        PipelineOutcome::Failure { kind, message } => {
            error!(kind = %kind, "{}", message);
            ExitCode::FAILURE
        }
    }
}
