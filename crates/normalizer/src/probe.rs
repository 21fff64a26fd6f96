//! Prober: enumerates the streams and chapters of an input container.
//!
//! The raw ffprobe JSON is parsed here; running ffprobe is the toolkit's job.
//! [`probe`] adds the structural checks every later stage relies on.

use crate::media::{normalize_language, Chapter, MediaContainer, Stream, StreamKind};
use crate::toolkit::MediaToolkit;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// The input has no container structure ffprobe understands.
    #[error("Unsupported or unrecognized container format: {0}")]
    UnsupportedFormat(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The container was parsed but holds no streams.
    #[error("Container has no streams: {0}")]
    NoStreams(String),

    /// Stream indices are not the contiguous on-disk sequence.
    #[error("Malformed stream list: {0}")]
    Malformed(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
        pub chapters: Option<Vec<Chapter>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<usize>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub channels: Option<u32>,
        pub channel_layout: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub default: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Chapter {
        pub id: Option<i64>,
        pub start_time: Option<String>,
        pub end_time: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }
}

/// Tags keys differ in case between containers (Matroska vs MP4).
fn tag<'a>(tags: &'a std::collections::HashMap<String, String>, key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Parses ffprobe JSON output into a MediaContainer.
///
/// Stream order is taken as reported. A stream without an explicit index gets
/// its position in the list.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<MediaContainer, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let streams = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, raw)| {
            let kind = StreamKind::from_codec_type(raw.codec_type.as_deref().unwrap_or(""));
            let (channels, channel_layout) = if kind == StreamKind::Audio {
                let layout = non_empty(raw.channel_layout.as_deref())
                    .or_else(|| implied_layout(raw.channels).map(String::from));
                (raw.channels, layout)
            } else {
                (None, None)
            };

            Stream {
                index: raw.index.unwrap_or(position),
                kind,
                codec_name: raw.codec_name.unwrap_or_default(),
                language: normalize_language(tag(&raw.tags, "language")),
                title: non_empty(tag(&raw.tags, "title")),
                channels,
                channel_layout,
                default: raw.disposition.map(|d| d.default != 0).unwrap_or(false),
            }
        })
        .collect();

    let chapters = ffprobe
        .chapters
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, raw)| Chapter {
            id: raw.id.unwrap_or(position as i64),
            start_secs: parse_secs(raw.start_time.as_deref()),
            end_secs: parse_secs(raw.end_time.as_deref()),
            title: non_empty(tag(&raw.tags, "title")),
        })
        .collect();

    Ok(MediaContainer {
        path: path.to_path_buf(),
        format_name: format.format_name.unwrap_or_default(),
        duration_secs: parse_secs(format.duration.as_deref()),
        title: non_empty(tag(&format.tags, "title")),
        streams,
        chapters,
    })
}

fn parse_secs(value: Option<&str>) -> f64 {
    value.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
}

/// Layout name implied by a bare channel count.
fn implied_layout(channels: Option<u32>) -> Option<&'static str> {
    match channels {
        Some(1) => Some("mono"),
        Some(2) => Some("stereo"),
        _ => None,
    }
}

/// Checks that a probed container can drive the rest of the pipeline.
///
/// - at least one stream
/// - stream indices are exactly `0..n` in ascending order
pub fn validate_container(container: &MediaContainer) -> Result<(), ProbeError> {
    if container.streams.is_empty() {
        return Err(ProbeError::NoStreams(container.path.display().to_string()));
    }

    for (position, stream) in container.streams.iter().enumerate() {
        if stream.index != position {
            return Err(ProbeError::Malformed(format!(
                "stream at position {} reports index {}",
                position, stream.index
            )));
        }
    }

    Ok(())
}

/// Probe an input file and validate its stream list.
pub async fn probe<T: MediaToolkit + ?Sized>(
    toolkit: &T,
    input: &Path,
) -> Result<MediaContainer, ProbeError> {
    // Distinguish a missing file from a format problem before spawning anything.
    tokio::fs::metadata(input).await?;

    let container = toolkit.probe(input).await?;
    validate_container(&container)?;

    info!(
        path = %input.display(),
        format = %container.format_name,
        streams = container.streams.len(),
        audio_streams = container.audio_indices().len(),
        chapters = container.chapters.len(),
        "probed input"
    );
    for stream in &container.streams {
        debug!(
            index = stream.index,
            kind = %stream.kind,
            codec = %stream.codec_name,
            language = stream.language.as_deref().unwrap_or("und"),
            layout = stream.channel_layout.as_deref().unwrap_or("-"),
            "stream"
        );
    }

    Ok(container)
}
