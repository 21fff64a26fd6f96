//! ffprobe/ffmpeg capability provider.
//!
//! Every tool invocation is a child process spawned with `kill_on_drop`, so
//! dropping a pending future (cancellation) terminates the process with it.

use super::{EncodeRequest, MediaToolkit, MuxRequest, MuxSource};
use crate::encode::EncodeError;
use crate::loudness::{
    parse_loudnorm_output, parse_progress_duration, AnalysisError, LoudnessMeasurement,
};
use crate::media::{MediaContainer, Stream};
use crate::probe::{parse_ffprobe_output, ProbeError};
use crate::remux::RemuxError;
use async_trait::async_trait;
use movie_normalizer_config::ToolsConfig;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Analysis-only loudnorm settings. Targets do not affect the `input_*` stats.
const LOUDNORM_ANALYSIS: &str = "loudnorm=I=-23:TP=-1:LRA=11:print_format=json";

/// Flags shared by every ffmpeg invocation.
const FFMPEG_QUIET: &[&str] = &["-nostdin", "-hide_banner", "-nostats"];

/// Toolkit backed by the ffprobe and ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegToolkit {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(tools.ffmpeg.clone(), tools.ffprobe.clone())
    }
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

/// Build the ffprobe command listing streams, format and chapters as JSON.
pub fn build_probe_command(ffprobe: &Path, input: &Path) -> Command {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "-show_chapters",
    ]);
    cmd.arg(input);
    cmd
}

/// Build the full-duration loudness measurement command for one stream.
///
/// Decoded audio goes to the null muxer; the loudnorm summary lands on
/// stderr and progress (for the measured duration) on stdout.
pub fn build_measure_command(
    ffmpeg: &Path,
    input: &Path,
    stream_index: usize,
    pre_filter: Option<&str>,
) -> Command {
    let filter = match pre_filter {
        Some(pre) => format!("{},{}", pre, LOUDNORM_ANALYSIS),
        None => LOUDNORM_ANALYSIS.to_string(),
    };

    let mut cmd = Command::new(ffmpeg);
    cmd.args(FFMPEG_QUIET);
    cmd.arg("-i").arg(input);
    cmd.arg("-map").arg(format!("0:{}", stream_index));
    cmd.args(["-vn", "-sn", "-dn"]);
    cmd.arg("-af").arg(filter);
    cmd.args(["-progress", "pipe:1"]);
    cmd.args(["-f", "null", "-"]);
    cmd
}

/// Build the command encoding one audio stream into a Matroska audio file.
pub fn build_encode_command(ffmpeg: &Path, request: &EncodeRequest) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(FFMPEG_QUIET);
    cmd.args(["-loglevel", "error", "-y"]);
    cmd.arg("-i").arg(&request.input);
    cmd.arg("-map").arg(format!("0:{}", request.stream_index));
    cmd.args(["-vn", "-sn", "-dn"]);
    // Stream tags and chapters are restored from the original during remux
    cmd.args(["-map_metadata", "-1", "-map_chapters", "-1"]);
    cmd.arg("-af").arg(&request.filter_chain);
    cmd.arg("-c:a").arg(request.codec.encoder_name());
    if let Some(kbps) = request.bitrate_kbps {
        cmd.arg("-b:a").arg(format!("{}k", kbps));
    }
    if request.codec == movie_normalizer_config::TargetCodec::Opus {
        cmd.args(["-vbr", "on"]);
    }
    if let Some(channels) = request.output_channels {
        cmd.arg("-ac").arg(channels.to_string());
    }
    cmd.args(["-f", "matroska"]);
    cmd.arg(&request.output);
    cmd
}

/// Build the remux command assembling the output container.
///
/// Input 0 is the original file; artifacts follow as inputs 1.. in first-use
/// order. Streams are mapped one by one in output order, everything is
/// stream-copied, and container metadata and chapters come from input 0.
///
/// Once any stream-level `-map_metadata` is given, ffmpeg stops copying
/// stream tags by default for every output stream, so each output stream
/// gets an explicit mapping from its original. Replaced streams also get
/// their language and default flag back.
pub fn build_mux_command(ffmpeg: &Path, request: &MuxRequest) -> Command {
    let artifacts = request.artifact_inputs();

    let mut cmd = Command::new(ffmpeg);
    cmd.args(FFMPEG_QUIET);
    cmd.args(["-loglevel", "error", "-y"]);
    cmd.arg("-i").arg(&request.input);
    for artifact in &artifacts {
        cmd.arg("-i").arg(artifact);
    }

    for stream in &request.streams {
        let map = match &stream.source {
            MuxSource::Original => format!("0:{}", stream.original.index),
            MuxSource::Artifact(path) => {
                let input_number = artifacts
                    .iter()
                    .position(|a| *a == path.as_path())
                    .map(|p| p + 1)
                    .unwrap_or(0);
                format!("{}:a:0", input_number)
            }
        };
        cmd.arg("-map").arg(map);
    }

    cmd.args(["-map_metadata", "0", "-map_chapters", "0"]);
    cmd.args(["-c", "copy"]);

    for (output_index, stream) in request.streams.iter().enumerate() {
        cmd.arg(format!("-map_metadata:s:{}", output_index))
            .arg(format!("0:s:{}", stream.original.index));
        if !matches!(stream.source, MuxSource::Artifact(_)) {
            continue;
        }
        if let Some(language) = &stream.original.language {
            cmd.arg(format!("-metadata:s:{}", output_index))
                .arg(format!("language={}", language));
        }
        let disposition = if stream.original.default { "default" } else { "0" };
        cmd.arg(format!("-disposition:{}", output_index))
            .arg(disposition);
    }

    cmd.arg(&request.output);
    cmd
}

/// Run a command to completion with captured output.
///
/// The child is killed if the returned future is dropped before it finishes.
async fn run_captured(mut cmd: Command) -> std::io::Result<Output> {
    debug!(command = ?cmd.as_std(), "spawning");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.output().await
}

/// Last few non-empty stderr lines, for error messages.
fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, path: &Path) -> Result<MediaContainer, ProbeError> {
        let output = run_captured(build_probe_command(&self.ffprobe, path)).await?;

        if !output.status.success() {
            let message = stderr_tail(&output);
            if message.contains("Invalid data found") {
                return Err(ProbeError::UnsupportedFormat(format!(
                    "{}: {}",
                    path.display(),
                    message
                )));
            }
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status, message
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(path, &stdout)
    }

    async fn measure(
        &self,
        input: &Path,
        stream: &Stream,
        pre_filter: Option<&str>,
    ) -> Result<LoudnessMeasurement, AnalysisError> {
        let cmd = build_measure_command(&self.ffmpeg, input, stream.index, pre_filter);
        let output = run_captured(cmd).await?;

        if !output.status.success() {
            return match output.status.code() {
                Some(_) => Err(AnalysisError::DecodeFailed {
                    stream_index: stream.index,
                    message: stderr_tail(&output),
                }),
                None => Err(AnalysisError::Terminated(stream.index)),
            };
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stats = parse_loudnorm_output(&stderr)?;
        let progress = String::from_utf8_lossy(&output.stdout);
        let duration_secs = parse_progress_duration(&progress).unwrap_or(0.0);

        Ok(LoudnessMeasurement {
            stream_index: stream.index,
            integrated_lufs: stats.integrated_lufs,
            loudness_range_lu: stats.loudness_range_lu,
            true_peak_dbtp: stats.true_peak_dbtp,
            duration_secs,
        })
    }

    async fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError> {
        let output = run_captured(build_encode_command(&self.ffmpeg, request)).await?;

        if output.status.success() {
            return Ok(());
        }
        let message = stderr_tail(&output);
        if message.contains("No space left on device") {
            return Err(EncodeError::DiskFull(request.stream_index));
        }
        match output.status.code() {
            Some(code) => Err(EncodeError::EncoderFailed {
                stream_index: request.stream_index,
                code,
                message,
            }),
            None => Err(EncodeError::EncoderTerminated(request.stream_index)),
        }
    }

    async fn mux(&self, request: &MuxRequest) -> Result<(), RemuxError> {
        let output = run_captured(build_mux_command(&self.ffmpeg, request)).await?;

        if output.status.success() {
            return Ok(());
        }
        match output.status.code() {
            Some(code) => Err(RemuxError::MuxFailed {
                code,
                message: stderr_tail(&output),
            }),
            None => Err(RemuxError::MuxTerminated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamKind;
    use crate::toolkit::MuxStream;
    use movie_normalizer_config::TargetCodec;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn stream(index: usize, kind: StreamKind, language: Option<&str>, default: bool) -> Stream {
        Stream {
            index,
            kind,
            codec_name: "x".to_string(),
            language: language.map(String::from),
            title: None,
            channels: None,
            channel_layout: None,
            default,
        }
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/.-]{1,40}")
            .unwrap()
            .prop_filter("non-empty path", |s| s.len() > 1)
    }

    #[test]
    fn test_probe_command_requests_json_with_chapters() {
        let cmd = build_probe_command(Path::new("ffprobe"), Path::new("/m/in.mkv"));
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-print_format", "json"));
        assert!(args.contains(&"-show_streams".to_string()));
        assert!(args.contains(&"-show_chapters".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/m/in.mkv"));
    }

    #[test]
    fn test_measure_command_scans_one_stream_into_null() {
        let cmd = build_measure_command(Path::new("ffmpeg"), Path::new("/m/in.mkv"), 3, None);
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-map", "0:3"));
        assert!(has_flag_with_value(&args, "-af", LOUDNORM_ANALYSIS));
        assert!(has_flag_with_value(&args, "-progress", "pipe:1"));
        assert!(has_flag_with_value(&args, "-f", "null"));
        // No seeking or duration limits: the whole stream is measured
        assert!(!args.contains(&"-ss".to_string()));
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn test_measure_command_prepends_pre_filter() {
        let cmd = build_measure_command(
            Path::new("ffmpeg"),
            Path::new("/m/in.mkv"),
            1,
            Some("pan=stereo|FL=FL|FR=FR"),
        );
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(
            &args,
            "-af",
            &format!("pan=stereo|FL=FL|FR=FR,{}", LOUDNORM_ANALYSIS)
        ));
    }

    #[test]
    fn test_encode_command_flac_has_no_bitrate() {
        let request = EncodeRequest {
            input: PathBuf::from("/m/in.mkv"),
            stream_index: 2,
            gain_db: 1.0,
            filter_chain: "volume=1.000dB".to_string(),
            codec: TargetCodec::Flac,
            bitrate_kbps: None,
            output_channels: None,
            output: PathBuf::from("/tmp/run/stream-2.mka"),
        };
        let args = get_command_args(&build_encode_command(Path::new("ffmpeg"), &request));

        assert!(has_flag_with_value(&args, "-c:a", "flac"));
        assert!(!args.contains(&"-b:a".to_string()));
        assert!(!args.contains(&"-vbr".to_string()));
        assert!(!args.contains(&"-ac".to_string()));
    }

    #[test]
    fn test_mux_command_maps_in_input_order() {
        let request = MuxRequest {
            input: PathBuf::from("/m/in.mkv"),
            streams: vec![
                MuxStream {
                    original: stream(0, StreamKind::Video, None, true),
                    source: MuxSource::Original,
                },
                MuxStream {
                    original: stream(1, StreamKind::Audio, Some("eng"), true),
                    source: MuxSource::Artifact(PathBuf::from("/tmp/run/stream-1.mka")),
                },
                MuxStream {
                    original: stream(2, StreamKind::Audio, Some("ger"), false),
                    source: MuxSource::Original,
                },
                MuxStream {
                    original: stream(3, StreamKind::Audio, None, false),
                    source: MuxSource::Artifact(PathBuf::from("/tmp/run/stream-3.mka")),
                },
                MuxStream {
                    original: stream(4, StreamKind::Subtitle, Some("eng"), false),
                    source: MuxSource::Original,
                },
            ],
            output: PathBuf::from("/m/.out.mkv.partial.mkv"),
        };
        let args = get_command_args(&build_mux_command(Path::new("ffmpeg"), &request));

        let maps: Vec<&str> = args
            .windows(2)
            .filter(|p| p[0] == "-map")
            .map(|p| p[1].as_str())
            .collect();
        assert_eq!(maps, vec!["0:0", "1:a:0", "0:2", "2:a:0", "0:4"]);

        let inputs: Vec<&str> = args
            .windows(2)
            .filter(|p| p[0] == "-i")
            .map(|p| p[1].as_str())
            .collect();
        assert_eq!(
            inputs,
            vec!["/m/in.mkv", "/tmp/run/stream-1.mka", "/tmp/run/stream-3.mka"]
        );

        assert!(has_flag_with_value(&args, "-c", "copy"));
        assert!(has_flag_with_value(&args, "-map_chapters", "0"));
        assert!(has_flag_with_value(&args, "-map_metadata", "0"));
        assert!(has_flag_with_value(&args, "-map_metadata:s:1", "0:s:1"));
        assert!(has_flag_with_value(&args, "-metadata:s:1", "language=eng"));
        assert!(has_flag_with_value(&args, "-disposition:1", "default"));
        assert!(has_flag_with_value(&args, "-map_metadata:s:3", "0:s:3"));
        assert!(has_flag_with_value(&args, "-disposition:3", "0"));
        // Every output stream maps its tags from its original stream
        let metadata_maps: Vec<(&str, &str)> = args
            .windows(2)
            .filter(|p| p[0].starts_with("-map_metadata:s:"))
            .map(|p| (p[0].as_str(), p[1].as_str()))
            .collect();
        assert_eq!(
            metadata_maps,
            vec![
                ("-map_metadata:s:0", "0:s:0"),
                ("-map_metadata:s:1", "0:s:1"),
                ("-map_metadata:s:2", "0:s:2"),
                ("-map_metadata:s:3", "0:s:3"),
                ("-map_metadata:s:4", "0:s:4"),
            ]
        );
        // Disposition is only rewritten for replaced streams
        assert!(!args.iter().any(|a| a == "-disposition:2"));
        assert!(!args.iter().any(|a| a == "-metadata:s:4"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/m/.out.mkv.partial.mkv")
        );
    }

    #[test]
    fn test_mux_command_without_replacements_maps_every_stream() {
        let request = MuxRequest {
            input: PathBuf::from("/m/in.mkv"),
            streams: vec![
                MuxStream {
                    original: stream(0, StreamKind::Video, None, true),
                    source: MuxSource::Original,
                },
                MuxStream {
                    original: stream(1, StreamKind::Subtitle, Some("fre"), false),
                    source: MuxSource::Original,
                },
            ],
            output: PathBuf::from("/m/out.mkv"),
        };
        let args = get_command_args(&build_mux_command(Path::new("ffmpeg"), &request));

        assert!(has_flag_with_value(&args, "-map_metadata:s:0", "0:s:0"));
        assert!(has_flag_with_value(&args, "-map_metadata:s:1", "0:s:1"));
        assert!(!args.iter().any(|a| a.starts_with("-disposition")));
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
    }

    // Any encode request yields a command carrying the input, the stream map,
    // the exact filter chain, the encoder, and the artifact path last.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_encode_command_completeness(
            input in path_strategy(),
            output in path_strategy(),
            stream_index in 0usize..32,
            gain in -40.0f64..40.0,
            kbps in 64u32..512,
            downmix in proptest::bool::ANY,
        ) {
            let request = EncodeRequest {
                input: PathBuf::from(&input),
                stream_index,
                gain_db: gain,
                filter_chain: crate::encode::build_filter_chain(gain, None),
                codec: TargetCodec::Opus,
                bitrate_kbps: Some(kbps),
                output_channels: if downmix { Some(2) } else { None },
                output: PathBuf::from(&output),
            };

            let cmd = build_encode_command(Path::new("/usr/bin/ffmpeg"), &request);
            let args = get_command_args(&cmd);
            let map_arg = format!("0:{}", stream_index);
            let bitrate_arg = format!("{}k", kbps);

            prop_assert_eq!(cmd.as_std().get_program(), std::ffi::OsStr::new("/usr/bin/ffmpeg"));
            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert!(has_flag_with_value(&args, "-map", &map_arg));
            prop_assert!(has_flag_with_value(&args, "-af", &request.filter_chain));
            prop_assert!(has_flag_with_value(&args, "-c:a", "libopus"));
            prop_assert!(has_flag_with_value(&args, "-b:a", &bitrate_arg));
            prop_assert!(has_flag_with_value(&args, "-vbr", "on"));
            prop_assert!(has_flag_with_value(&args, "-f", "matroska"));
            prop_assert_eq!(has_flag_with_value(&args, "-ac", "2"), downmix);
            prop_assert_eq!(args.last(), Some(&output));
        }
    }
}
