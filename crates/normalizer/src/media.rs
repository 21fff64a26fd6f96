//! Media data model shared by every pipeline stage.
//!
//! A [`MediaContainer`] is produced once by the prober and is never mutated
//! afterwards. Streams are addressed by their stable on-disk index.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of track within a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    /// Attachments, data tracks and anything else ffprobe reports.
    Other,
}

impl StreamKind {
    /// Map an ffprobe `codec_type` to a stream kind.
    pub fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            _ => StreamKind::Other,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Subtitle => write!(f, "subtitle"),
            StreamKind::Other => write!(f, "other"),
        }
    }
}

/// One track within a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    /// Stable index, equal to the stream's position in the container.
    pub index: usize,
    pub kind: StreamKind,
    /// Codec name as reported by ffprobe (e.g. "h264", "dts", "opus").
    pub codec_name: String,
    /// ISO 639 language tag. `und` is normalized to `None`.
    pub language: Option<String>,
    pub title: Option<String>,
    /// Channel count (audio only).
    pub channels: Option<u32>,
    /// Channel layout name such as "5.1(side)" (audio only).
    pub channel_layout: Option<String>,
    /// Whether the default disposition flag is set.
    #[serde(default)]
    pub default: bool,
}

impl Stream {
    pub fn is_audio(&self) -> bool {
        self.kind == StreamKind::Audio
    }
}

/// A chapter marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub id: i64,
    pub start_secs: f64,
    pub end_secs: f64,
    pub title: Option<String>,
}

/// A probed media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaContainer {
    pub path: PathBuf,
    /// Container format name (e.g. "matroska,webm").
    pub format_name: String,
    pub duration_secs: f64,
    /// Container-level title tag.
    pub title: Option<String>,
    /// Streams in on-disk order.
    pub streams: Vec<Stream>,
    pub chapters: Vec<Chapter>,
}

impl MediaContainer {
    /// Look up a stream by its stable index.
    pub fn stream(&self, index: usize) -> Option<&Stream> {
        self.streams.iter().find(|s| s.index == index)
    }

    /// Audio streams in on-disk order.
    pub fn audio_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(|s| s.is_audio())
    }

    /// Stable indices of all audio streams, ascending.
    pub fn audio_indices(&self) -> Vec<usize> {
        self.audio_streams().map(|s| s.index).collect()
    }
}

/// Normalize a language tag: empty and `und` mean "no language".
pub fn normalize_language(tag: Option<&str>) -> Option<String> {
    match tag.map(str::trim) {
        None | Some("") => None,
        Some(t) if t.eq_ignore_ascii_case("und") => None,
        Some(t) => Some(t.to_string()),
    }
}
