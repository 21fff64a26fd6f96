//! Audio encoder: applies a stream's planned gain and writes it in the target codec.
//!
//! Each re-encoded stream becomes one Matroska audio artifact inside the
//! run's temp directory. Pass-through streams never reach this module.

pub mod downmix;

use crate::context::RunContext;
use crate::media::MediaContainer;
use crate::plan::NormalizationPlan;
use crate::toolkit::{EncodeRequest, MediaToolkit};
use movie_normalizer_config::TargetCodec;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub use downmix::stereo_pan_filter;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The stream index is not in the container.
    #[error("Stream {0} does not exist in the input")]
    StreamNotFound(usize),

    /// The stream is not an audio stream.
    #[error("Stream {0} is not an audio stream")]
    NotAudio(usize),

    /// The plan belongs to a different stream.
    #[error("Plan for stream {got} passed while encoding stream {expected}")]
    PlanMismatch { expected: usize, got: usize },

    /// The plan says the stream is copied, not encoded.
    #[error("Stream {0} is planned as pass-through")]
    NotReEncode(usize),

    /// The target codec cannot carry this stream's channel layout.
    #[error("Stream {stream_index}: channel layout '{layout}' is not supported by {codec}")]
    UnsupportedLayout {
        stream_index: usize,
        layout: String,
        codec: TargetCodec,
    },

    /// ffmpeg exited with non-zero status
    #[error("Encoder failed on stream {stream_index} with exit code {code}: {message}")]
    EncoderFailed {
        stream_index: usize,
        code: i32,
        message: String,
    },

    /// ffmpeg was terminated by signal
    #[error("Encoder for stream {0} was terminated by signal")]
    EncoderTerminated(usize),

    /// The target filesystem ran out of space.
    #[error("No space left while encoding stream {0}")]
    DiskFull(usize),

    /// The encoder reported success but wrote nothing.
    #[error("Encoder produced an empty artifact for stream {0}")]
    EmptyArtifact(usize),

    /// An encode worker panicked or was aborted.
    #[error("Encode worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A temporary encoded audio stream tied to one original stream index.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudioArtifact {
    pub stream_index: usize,
    pub path: PathBuf,
    pub codec: TargetCodec,
}

/// Filter graph applying a fixed gain, optionally after a stereo fold-down.
pub fn build_filter_chain(gain_db: f64, pan: Option<&str>) -> String {
    let volume = format!("volume={:.3}dB", gain_db);
    match pan {
        Some(pan) => format!("{},{}", pan, volume),
        None => volume,
    }
}

/// Build the encode request for a re-encode plan, checking layout support.
pub fn build_encode_request(
    ctx: &RunContext,
    container: &MediaContainer,
    stream_index: usize,
    plan: &NormalizationPlan,
) -> Result<EncodeRequest, EncodeError> {
    if plan.stream_index != stream_index {
        return Err(EncodeError::PlanMismatch {
            expected: stream_index,
            got: plan.stream_index,
        });
    }
    if !plan.is_re_encode() {
        return Err(EncodeError::NotReEncode(stream_index));
    }

    let stream = container
        .stream(stream_index)
        .ok_or(EncodeError::StreamNotFound(stream_index))?;
    if !stream.is_audio() {
        return Err(EncodeError::NotAudio(stream_index));
    }

    let channels = stream.channels.unwrap_or(2);
    let layout = stream
        .channel_layout
        .clone()
        .unwrap_or_else(|| format!("{} channels", channels));
    let unsupported = || EncodeError::UnsupportedLayout {
        stream_index,
        layout: layout.clone(),
        codec: plan.codec,
    };

    let (pan, output_channels) = if plan.downmix_stereo && channels > 2 {
        let pan = stream
            .channel_layout
            .as_deref()
            .and_then(stereo_pan_filter)
            .ok_or_else(unsupported)?;
        (Some(pan), Some(2))
    } else {
        if channels > plan.codec.max_channels() {
            return Err(unsupported());
        }
        (None, None)
    };

    Ok(EncodeRequest {
        input: container.path.clone(),
        stream_index,
        gain_db: plan.gain_db,
        filter_chain: build_filter_chain(plan.gain_db, pan.as_deref()),
        codec: plan.codec,
        bitrate_kbps: plan.bitrate_kbps,
        output_channels,
        output: ctx.artifact_path(stream_index),
    })
}

/// Encode one audio stream according to its plan.
///
/// The gain is applied exactly as planned; nothing is re-measured. A failed
/// encode leaves no artifact behind.
pub async fn encode<T: MediaToolkit + ?Sized>(
    toolkit: &T,
    ctx: &RunContext,
    container: &MediaContainer,
    stream_index: usize,
    plan: &NormalizationPlan,
) -> Result<EncodedAudioArtifact, EncodeError> {
    let request = build_encode_request(ctx, container, stream_index, plan)?;

    info!(
        stream = stream_index,
        codec = %request.codec,
        gain_db = request.gain_db,
        filter = %request.filter_chain,
        "encoding stream"
    );

    if let Err(e) = toolkit.encode(&request).await {
        discard_partial(&request.output).await;
        return Err(e);
    }

    let size = match tokio::fs::metadata(&request.output).await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!(stream = stream_index, error = %e, "encoder left no artifact");
            return Err(EncodeError::EmptyArtifact(stream_index));
        }
    };
    if size == 0 {
        discard_partial(&request.output).await;
        return Err(EncodeError::EmptyArtifact(stream_index));
    }

    info!(stream = stream_index, bytes = size, "encoded stream");

    Ok(EncodedAudioArtifact {
        stream_index,
        path: request.output,
        codec: plan.codec,
    })
}

async fn discard_partial(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial artifact");
        }
    }
}
