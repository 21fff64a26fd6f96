//! Capability providers.
//!
//! The pipeline needs exactly four things from its environment: probe a
//! file, measure an audio stream, encode an audio stream, and mux streams
//! into a container. [`MediaToolkit`] is that seam. [`FfmpegToolkit`] shells
//! out to ffprobe/ffmpeg; tests substitute an in-memory fake.

pub mod ffmpeg;

use crate::encode::EncodeError;
use crate::loudness::{AnalysisError, LoudnessMeasurement};
use crate::media::{MediaContainer, Stream};
use crate::probe::ProbeError;
use crate::remux::RemuxError;
use async_trait::async_trait;
use movie_normalizer_config::TargetCodec;
use std::path::{Path, PathBuf};

pub use ffmpeg::FfmpegToolkit;

/// One audio encode: input stream, filter graph, target codec, output file.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub stream_index: usize,
    /// Gain the filter chain applies, in dB.
    pub gain_db: f64,
    /// Complete `-af` filter graph.
    pub filter_chain: String,
    pub codec: TargetCodec,
    pub bitrate_kbps: Option<u32>,
    /// Forced output channel count (set when folding down).
    pub output_channels: Option<u32>,
    pub output: PathBuf,
}

/// Where an output stream's payload comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxSource {
    /// Copy the stream with this index from the original input.
    Original,
    /// Copy the single audio stream of an encoded artifact.
    Artifact(PathBuf),
}

/// One output stream in a mux request.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxStream {
    /// The input stream this output stream stands for.
    pub original: Stream,
    pub source: MuxSource,
}

/// Full description of the output container, streams in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub input: PathBuf,
    pub streams: Vec<MuxStream>,
    pub output: PathBuf,
}

impl MuxRequest {
    /// Artifact paths in first-use order; their position + 1 is the ffmpeg input number.
    pub fn artifact_inputs(&self) -> Vec<&Path> {
        let mut inputs: Vec<&Path> = Vec::new();
        for stream in &self.streams {
            if let MuxSource::Artifact(path) = &stream.source {
                if !inputs.contains(&path.as_path()) {
                    inputs.push(path.as_path());
                }
            }
        }
        inputs
    }
}

/// External decode/encode/mux capabilities.
#[async_trait]
pub trait MediaToolkit: Send + Sync + 'static {
    /// Enumerate streams, chapters and container metadata of a file.
    async fn probe(&self, path: &Path) -> Result<MediaContainer, ProbeError>;

    /// Full-duration loudness measurement of one audio stream.
    ///
    /// `pre_filter` is applied before measuring (used to measure the stereo
    /// fold-down a stream will be encoded with).
    async fn measure(
        &self,
        input: &Path,
        stream: &Stream,
        pre_filter: Option<&str>,
    ) -> Result<LoudnessMeasurement, AnalysisError>;

    /// Encode one audio stream into a standalone artifact file.
    async fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError>;

    /// Write the output container described by `request`.
    async fn mux(&self, request: &MuxRequest) -> Result<(), RemuxError>;
}
