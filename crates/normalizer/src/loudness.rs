//! Loudness analyzer: one full-duration EBU R128 measurement pass per audio stream.
//!
//! The measurement runs ffmpeg's `loudnorm` filter in analysis mode over the
//! whole stream. The filter prints its statistics as a JSON block on stderr;
//! the processed duration comes from ffmpeg's `-progress` stream on stdout.

use crate::encode::stereo_pan_filter;
use crate::media::MediaContainer;
use crate::toolkit::MediaToolkit;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Tolerance for comparing two measurements of the same audio (LU and dB).
pub const MEASUREMENT_EPSILON: f64 = 0.1;

/// Error type for loudness analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The requested stream index is not in the container.
    #[error("Stream {0} does not exist in the input")]
    StreamNotFound(usize),

    /// The requested stream is not an audio stream.
    #[error("Stream {0} is not an audio stream")]
    NotAudio(usize),

    /// ffmpeg could not decode the stream.
    #[error("Decoding stream {stream_index} failed: {message}")]
    DecodeFailed { stream_index: usize, message: String },

    /// ffmpeg was terminated by a signal.
    #[error("Measurement of stream {0} was terminated by signal")]
    Terminated(usize),

    /// The loudnorm statistics could not be found or parsed.
    #[error("Failed to parse loudness measurement: {0}")]
    ParseError(String),

    /// Integrated loudness is not finite (digital silence).
    #[error("Stream {0} has no measurable loudness")]
    NoMeasurableAudio(usize),

    /// No audio samples were decoded.
    #[error("Stream {0} contains no audio")]
    ZeroLength(usize),

    /// The measurement returned stats for a different stream.
    #[error("Measurement for stream {got} returned while measuring stream {expected}")]
    WrongStream { expected: usize, got: usize },

    /// A measurement worker panicked or was aborted.
    #[error("Measurement worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// IO error while spawning or reading the measurement process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Loudness statistics of one audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessMeasurement {
    pub stream_index: usize,
    /// Integrated loudness in LUFS.
    pub integrated_lufs: f64,
    /// Loudness range in LU.
    pub loudness_range_lu: f64,
    /// True peak in dBTP.
    pub true_peak_dbtp: f64,
    /// Duration of audio actually measured, in seconds.
    pub duration_secs: f64,
}

impl LoudnessMeasurement {
    /// Whether two measurements agree within [`MEASUREMENT_EPSILON`].
    pub fn approx_eq(&self, other: &LoudnessMeasurement) -> bool {
        self.stream_index == other.stream_index
            && (self.integrated_lufs - other.integrated_lufs).abs() < MEASUREMENT_EPSILON
            && (self.true_peak_dbtp - other.true_peak_dbtp).abs() < MEASUREMENT_EPSILON
    }
}

/// The `input_*` fields of loudnorm's JSON summary.
#[derive(Debug, Deserialize)]
struct LoudnormSummary {
    input_i: String,
    input_tp: String,
    input_lra: String,
}

/// Values extracted from a loudnorm analysis run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnormStats {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub loudness_range_lu: f64,
}

/// Extract the loudnorm JSON summary from ffmpeg's stderr.
///
/// The summary is the last `{ ... }` block; anything ffmpeg logs before it is
/// ignored. Values are strings and may be `-inf` for silent input.
pub fn parse_loudnorm_output(stderr: &str) -> Result<LoudnormStats, AnalysisError> {
    let start = stderr
        .rfind('{')
        .ok_or_else(|| AnalysisError::ParseError("no loudnorm summary in output".to_string()))?;
    let end = stderr[start..]
        .find('}')
        .map(|offset| start + offset)
        .ok_or_else(|| AnalysisError::ParseError("unterminated loudnorm summary".to_string()))?;

    let summary: LoudnormSummary = serde_json::from_str(&stderr[start..=end])
        .map_err(|e| AnalysisError::ParseError(e.to_string()))?;

    Ok(LoudnormStats {
        integrated_lufs: parse_stat("input_i", &summary.input_i)?,
        true_peak_dbtp: parse_stat("input_tp", &summary.input_tp)?,
        loudness_range_lu: parse_stat("input_lra", &summary.input_lra)?,
    })
}

fn parse_stat(name: &str, value: &str) -> Result<f64, AnalysisError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| AnalysisError::ParseError(format!("{} is not a number: '{}'", name, value)))
}

/// Processed duration from ffmpeg `-progress` output, in seconds.
///
/// Uses the last `out_time_us` entry; `N/A` entries are skipped.
pub fn parse_progress_duration(progress: &str) -> Option<f64> {
    progress
        .lines()
        .filter_map(|line| line.trim().strip_prefix("out_time_us="))
        .filter_map(|v| v.trim().parse::<i64>().ok())
        .last()
        .map(|us| us.max(0) as f64 / 1_000_000.0)
}

/// Measure one audio stream of a probed container.
///
/// Always scans the full stream. With `downmix_stereo` set, a surround stream
/// is measured through the same stereo fold-down it will be encoded with, so
/// the planned gain matches what the encoder sees. The result is checked for
/// a finite loudness and a non-zero duration before it is handed to the
/// planner.
pub async fn measure<T: MediaToolkit + ?Sized>(
    toolkit: &T,
    container: &MediaContainer,
    stream_index: usize,
    downmix_stereo: bool,
) -> Result<LoudnessMeasurement, AnalysisError> {
    let stream = container
        .stream(stream_index)
        .ok_or(AnalysisError::StreamNotFound(stream_index))?;
    if !stream.is_audio() {
        return Err(AnalysisError::NotAudio(stream_index));
    }

    let pre_filter = if downmix_stereo && stream.channels.unwrap_or(2) > 2 {
        stream.channel_layout.as_deref().and_then(stereo_pan_filter)
    } else {
        None
    };

    let measurement = toolkit
        .measure(&container.path, stream, pre_filter.as_deref())
        .await?;

    if measurement.stream_index != stream_index {
        return Err(AnalysisError::WrongStream {
            expected: stream_index,
            got: measurement.stream_index,
        });
    }
    if measurement.duration_secs <= 0.0 {
        return Err(AnalysisError::ZeroLength(stream_index));
    }
    if !measurement.integrated_lufs.is_finite() || !measurement.true_peak_dbtp.is_finite() {
        return Err(AnalysisError::NoMeasurableAudio(stream_index));
    }

    info!(
        stream = stream_index,
        integrated_lufs = measurement.integrated_lufs,
        loudness_range_lu = measurement.loudness_range_lu,
        true_peak_dbtp = measurement.true_peak_dbtp,
        duration_secs = measurement.duration_secs,
        "measured loudness"
    );

    Ok(measurement)
}
