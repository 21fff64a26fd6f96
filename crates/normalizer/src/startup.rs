//! Startup checks module
//!
//! Preflight checks run before a pipeline starts:
//! - ffprobe availability
//! - FFmpeg availability and version (requires 4.0+)
//! - Encoder for the target codec compiled into FFmpeg

use movie_normalizer_config::{Config, TargetCodec};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Oldest FFmpeg major version with `-progress` `out_time_us` and `loudnorm` JSON output.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("FFmpeg has no '{encoder}' encoder for target codec {codec}")]
    UnsupportedCodec { codec: TargetCodec, encoder: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `<tool> <arg>` and return its stdout, failing if it cannot run.
fn run_tool(tool: &Path, arg: &str) -> Result<String, StartupError> {
    let name = tool.display().to_string();
    let output = Command::new(tool).arg(arg).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool: name.clone(),
            reason: format!("{} {} failed; is it installed and in PATH? Error: {}", name, arg, e),
        }
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: name.clone(),
            reason: format!("{} {} exited with {}", name, arg, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that a tool runs by invoking `<tool> -version`.
pub fn check_tool_available(tool: &Path) -> Result<(), StartupError> {
    run_tool(tool, "-version").map(|_| ())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
/// - Distribution builds: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
///
/// Git snapshot builds ("ffmpeg version N-112345-g...") carry no release
/// number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check that FFmpeg is new enough.
///
/// Unparseable versions (git snapshots) are accepted.
pub fn check_ffmpeg_version(ffmpeg: &Path) -> Result<(), StartupError> {
    let version_output = run_tool(ffmpeg, "-version")?;

    match parse_ffmpeg_version(&version_output) {
        Some(major) if major < MIN_FFMPEG_MAJOR => Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        ))),
        Some(major) => {
            debug!(major, "ffmpeg version");
            Ok(())
        }
        None => {
            debug!(
                first_line = version_output.lines().next().unwrap_or("(empty)"),
                "could not parse ffmpeg version, assuming snapshot build"
            );
            Ok(())
        }
    }
}

/// Whether `ffmpeg -encoders` output lists an encoder by name.
///
/// Encoder lines look like ` A....D libopus   libopus Opus`; the second
/// column is the encoder name.
pub fn encoder_listed(encoders_output: &str, encoder: &str) -> bool {
    encoders_output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(flags), Some(name)) => flags.starts_with('A') && name == encoder,
            _ => false,
        }
    })
}

/// Check that FFmpeg can encode the target codec.
pub fn check_encoder_available(ffmpeg: &Path, codec: TargetCodec) -> Result<(), StartupError> {
    let encoders = run_tool(ffmpeg, "-encoders")?;
    if !encoder_listed(&encoders, codec.encoder_name()) {
        return Err(StartupError::UnsupportedCodec {
            codec,
            encoder: codec.encoder_name().to_string(),
        });
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffprobe availability
/// 2. FFmpeg version
/// 3. Target encoder availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_tool_available(&cfg.tools.ffprobe)?;
    check_ffmpeg_version(&cfg.tools.ffmpeg)?;
    check_encoder_available(&cfg.tools.ffmpeg, cfg.encoder.codec)?;
    info!(
        ffmpeg = %cfg.tools.ffmpeg.display(),
        ffprobe = %cfg.tools.ffprobe.display(),
        encoder = cfg.encoder.codec.encoder_name(),
        "startup checks passed"
    );
    Ok(())
}
