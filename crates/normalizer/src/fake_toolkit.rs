//! In-memory stand-in for ffprobe/ffmpeg used by tests.
//!
//! A "media file" is a real file holding a JSON [`FakeMedia`]: the container
//! description, each stream's payload bytes, and each audio stream's
//! loudness. Encoding shifts the stored loudness by the requested gain, so a
//! pipeline run can be checked end to end without real audio.

use crate::encode::EncodeError;
use crate::loudness::{AnalysisError, LoudnessMeasurement};
use crate::media::{Chapter, MediaContainer, Stream, StreamKind};
use crate::probe::ProbeError;
use crate::remux::RemuxError;
use crate::toolkit::ffmpeg::build_mux_command;
use crate::toolkit::{EncodeRequest, MediaToolkit, MuxRequest, MuxSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FakeLoudness {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub loudness_range_lu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeStream {
    pub info: Stream,
    pub payload: Vec<u8>,
    pub loudness: Option<FakeLoudness>,
    /// Digital silence: measures as negative infinity.
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeMedia {
    pub format_name: String,
    pub title: Option<String>,
    pub duration_secs: f64,
    pub chapters: Vec<Chapter>,
    pub streams: Vec<FakeStream>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self {
            format_name: "matroska,webm".to_string(),
            title: Some("Feature Film".to_string()),
            duration_secs: 5400.0,
            chapters: vec![
                Chapter {
                    id: 1,
                    start_secs: 0.0,
                    end_secs: 1800.0,
                    title: Some("Act I".to_string()),
                },
                Chapter {
                    id: 2,
                    start_secs: 1800.0,
                    end_secs: 5400.0,
                    title: Some("Act II".to_string()),
                },
            ],
            streams: Vec::new(),
        }
    }

    fn push(mut self, info: Stream, loudness: Option<FakeLoudness>) -> Self {
        let payload = format!("{}-{}-payload", info.kind, info.index).into_bytes();
        self.streams.push(FakeStream {
            info,
            payload,
            loudness,
            silent: false,
        });
        self
    }

    pub fn video(self, codec: &str) -> Self {
        let index = self.streams.len();
        self.push(
            Stream {
                index,
                kind: StreamKind::Video,
                codec_name: codec.to_string(),
                language: None,
                title: None,
                channels: None,
                channel_layout: None,
                default: true,
            },
            None,
        )
    }

    pub fn audio(self, language: &str, integrated_lufs: f64, true_peak_dbtp: f64) -> Self {
        self.audio_with_layout(language, integrated_lufs, true_peak_dbtp, 2, "stereo")
    }

    pub fn audio_with_layout(
        self,
        language: &str,
        integrated_lufs: f64,
        true_peak_dbtp: f64,
        channels: u32,
        layout: &str,
    ) -> Self {
        let index = self.streams.len();
        let first_audio = !self.streams.iter().any(|s| s.info.is_audio());
        self.push(
            Stream {
                index,
                kind: StreamKind::Audio,
                codec_name: "ac3".to_string(),
                language: Some(language.to_string()),
                title: Some(format!("{} track", language)),
                channels: Some(channels),
                channel_layout: Some(layout.to_string()),
                default: first_audio,
            },
            Some(FakeLoudness {
                integrated_lufs,
                true_peak_dbtp,
                loudness_range_lu: 12.0,
            }),
        )
    }

    /// An audio stream of digital silence.
    pub fn silent_audio(self, language: &str) -> Self {
        let mut media = self.audio(language, -70.0, -70.0);
        if let Some(last) = media.streams.last_mut() {
            last.silent = true;
        }
        media
    }

    pub fn subtitle(self, language: &str) -> Self {
        let index = self.streams.len();
        self.push(
            Stream {
                index,
                kind: StreamKind::Subtitle,
                codec_name: "subrip".to_string(),
                language: Some(language.to_string()),
                title: None,
                channels: None,
                channel_layout: None,
                default: false,
            },
            None,
        )
    }

    pub fn write(&self, path: &Path) {
        let json = serde_json::to_vec_pretty(self).unwrap();
        std::fs::write(path, json).unwrap();
    }

    pub fn read(path: &Path) -> Self {
        let data = std::fs::read(path).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    fn to_container(&self, path: &Path) -> MediaContainer {
        MediaContainer {
            path: path.to_path_buf(),
            format_name: self.format_name.clone(),
            duration_secs: self.duration_secs,
            title: self.title.clone(),
            streams: self.streams.iter().map(|s| s.info.clone()).collect(),
            chapters: self.chapters.clone(),
        }
    }
}

async fn load(path: &Path) -> std::io::Result<FakeMedia> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Fake toolkit with per-stream failure and delay injection.
#[derive(Debug, Default)]
pub struct FakeToolkit {
    fail_measure: HashSet<usize>,
    fail_encode: HashSet<usize>,
    encode_delays: HashMap<usize, Duration>,
    fail_mux: bool,
    drop_stream_on_mux: bool,
    encoded: Mutex<Vec<usize>>,
    measured: Mutex<Vec<usize>>,
}

impl FakeToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_measure(mut self, stream_index: usize) -> Self {
        self.fail_measure.insert(stream_index);
        self
    }

    pub fn failing_encode(mut self, stream_index: usize) -> Self {
        self.fail_encode.insert(stream_index);
        self
    }

    pub fn slow_encode(mut self, stream_index: usize, delay: Duration) -> Self {
        self.encode_delays.insert(stream_index, delay);
        self
    }

    pub fn failing_mux(mut self) -> Self {
        self.fail_mux = true;
        self
    }

    /// Mux writes every stream except the last one.
    pub fn dropping_stream_on_mux(mut self) -> Self {
        self.drop_stream_on_mux = true;
        self
    }

    /// Streams whose encode finished, in completion order.
    pub fn encoded(&self) -> Vec<usize> {
        self.encoded.lock().unwrap().clone()
    }

    pub fn measured(&self) -> Vec<usize> {
        let mut measured = self.measured.lock().unwrap().clone();
        measured.sort_unstable();
        measured
    }
}

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe(&self, path: &Path) -> Result<MediaContainer, ProbeError> {
        let media = load(path)
            .await
            .map_err(|e| ProbeError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;
        Ok(media.to_container(path))
    }

    async fn measure(
        &self,
        input: &Path,
        stream: &Stream,
        _pre_filter: Option<&str>,
    ) -> Result<LoudnessMeasurement, AnalysisError> {
        if self.fail_measure.contains(&stream.index) {
            return Err(AnalysisError::DecodeFailed {
                stream_index: stream.index,
                message: "Invalid data found when processing input".to_string(),
            });
        }
        let media = load(input).await?;
        let fake = media
            .streams
            .get(stream.index)
            .ok_or(AnalysisError::StreamNotFound(stream.index))?;
        let mut loudness = fake.loudness.ok_or(AnalysisError::NotAudio(stream.index))?;
        if fake.silent {
            loudness.integrated_lufs = f64::NEG_INFINITY;
            loudness.true_peak_dbtp = f64::NEG_INFINITY;
        }
        self.measured.lock().unwrap().push(stream.index);

        Ok(LoudnessMeasurement {
            stream_index: stream.index,
            integrated_lufs: loudness.integrated_lufs,
            loudness_range_lu: loudness.loudness_range_lu,
            true_peak_dbtp: loudness.true_peak_dbtp,
            duration_secs: media.duration_secs,
        })
    }

    async fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError> {
        if let Some(delay) = self.encode_delays.get(&request.stream_index) {
            tokio::time::sleep(*delay).await;
        }
        if self.fail_encode.contains(&request.stream_index) {
            // A failing encoder still leaves a partial file behind
            tokio::fs::write(&request.output, b"partial").await?;
            return Err(EncodeError::EncoderFailed {
                stream_index: request.stream_index,
                code: 1,
                message: "Error while encoding".to_string(),
            });
        }

        let media = load(&request.input).await?;
        let source = media
            .streams
            .get(request.stream_index)
            .cloned()
            .ok_or(EncodeError::StreamNotFound(request.stream_index))?;

        let mut info = source.info.clone();
        info.index = 0;
        info.codec_name = request.codec.codec_name().to_string();
        if let Some(channels) = request.output_channels {
            info.channels = Some(channels);
            info.channel_layout = Some("stereo".to_string());
        }
        let loudness = source.loudness.map(|l| FakeLoudness {
            integrated_lufs: l.integrated_lufs + request.gain_db,
            true_peak_dbtp: l.true_peak_dbtp + request.gain_db,
            loudness_range_lu: l.loudness_range_lu,
        });
        let artifact = FakeMedia {
            format_name: "matroska,webm".to_string(),
            title: None,
            duration_secs: media.duration_secs,
            chapters: Vec::new(),
            streams: vec![FakeStream {
                info,
                payload: format!("{}:{}", request.codec, request.filter_chain).into_bytes(),
                loudness,
                silent: source.silent,
            }],
        };

        let json = serde_json::to_vec(&artifact)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&request.output, json).await?;
        self.encoded.lock().unwrap().push(request.stream_index);
        Ok(())
    }

    async fn mux(&self, request: &MuxRequest) -> Result<(), RemuxError> {
        if self.fail_mux {
            tokio::fs::write(&request.output, b"truncated").await?;
            return Err(RemuxError::MuxFailed {
                code: 1,
                message: "Conversion failed!".to_string(),
            });
        }

        let input = load(&request.input).await?;
        let tags = StreamTagArgs::from_request(request);
        let mut streams = Vec::with_capacity(request.streams.len());
        for (position, mux_stream) in request.streams.iter().enumerate() {
            let original = input
                .streams
                .get(mux_stream.original.index)
                .cloned()
                .ok_or_else(|| RemuxError::StreamMismatch("unknown stream".to_string()))?;
            let mut stream = match &mux_stream.source {
                MuxSource::Original => original,
                MuxSource::Artifact(path) => {
                    let artifact = load(path).await?;
                    let encoded = artifact
                        .streams
                        .into_iter()
                        .next()
                        .ok_or_else(|| RemuxError::StreamMismatch("empty artifact".to_string()))?;
                    // Disposition comes from the original, tags only when mapped
                    let mut info = original.info.clone();
                    info.codec_name = encoded.info.codec_name;
                    info.channels = encoded.info.channels;
                    info.channel_layout = encoded.info.channel_layout;
                    FakeStream {
                        info,
                        payload: encoded.payload,
                        loudness: encoded.loudness,
                        silent: encoded.silent,
                    }
                }
            };
            tags.apply(position, &mut stream.info);
            stream.info.index = position;
            streams.push(stream);
        }
        if self.drop_stream_on_mux {
            streams.pop();
        }

        let output = FakeMedia {
            format_name: input.format_name,
            title: input.title,
            duration_secs: input.duration_secs,
            chapters: input.chapters,
            streams,
        };
        let json = serde_json::to_vec(&output)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&request.output, json).await?;
        Ok(())
    }
}

/// Stream tag handling of the real mux command.
///
/// ffmpeg copies stream tags by default only while no stream-level
/// `-map_metadata` is given; with any such mapping, streams without one of
/// their own come out untagged. `-metadata:s:N language=..` is applied last.
struct StreamTagArgs {
    mapped: HashSet<usize>,
    languages: HashMap<usize, String>,
}

impl StreamTagArgs {
    fn from_request(request: &MuxRequest) -> Self {
        let cmd = build_mux_command(Path::new("ffmpeg"), request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .filter_map(|a| a.to_str().map(String::from))
            .collect();

        let mut mapped = HashSet::new();
        let mut languages = HashMap::new();
        for pair in args.windows(2) {
            if let Some(n) = pair[0].strip_prefix("-map_metadata:s:") {
                mapped.insert(n.parse().unwrap());
            } else if let Some(n) = pair[0].strip_prefix("-metadata:s:") {
                if let Some(language) = pair[1].strip_prefix("language=") {
                    languages.insert(n.parse().unwrap(), language.to_string());
                }
            }
        }
        Self { mapped, languages }
    }

    fn apply(&self, position: usize, info: &mut Stream) {
        if !self.mapped.is_empty() && !self.mapped.contains(&position) {
            info.language = None;
            info.title = None;
        }
        if let Some(language) = self.languages.get(&position) {
            info.language = Some(language.clone());
        }
    }
}

/// Write `media` as `name` in `dir` and return its path.
pub fn write_media(dir: &Path, name: &str, media: &FakeMedia) -> PathBuf {
    let path = dir.join(name);
    media.write(&path);
    path
}
