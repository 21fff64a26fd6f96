//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Audio codec that re-encoded streams are written in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetCodec {
    #[default]
    Opus,
    Aac,
    Flac,
    Ac3,
}

impl TargetCodec {
    /// Codec name as reported by ffprobe (`codec_name`)
    pub fn codec_name(&self) -> &'static str {
        match self {
            TargetCodec::Opus => "opus",
            TargetCodec::Aac => "aac",
            TargetCodec::Flac => "flac",
            TargetCodec::Ac3 => "ac3",
        }
    }

    /// ffmpeg encoder used to produce this codec
    pub fn encoder_name(&self) -> &'static str {
        match self {
            TargetCodec::Opus => "libopus",
            TargetCodec::Aac => "aac",
            TargetCodec::Flac => "flac",
            TargetCodec::Ac3 => "ac3",
        }
    }

    /// Bitrate used when none is configured. Lossless codecs have none.
    pub fn default_bitrate_kbps(&self) -> Option<u32> {
        match self {
            TargetCodec::Opus => Some(192),
            TargetCodec::Aac => Some(256),
            TargetCodec::Flac => None,
            TargetCodec::Ac3 => Some(640),
        }
    }

    /// Highest channel count the encoder accepts
    pub fn max_channels(&self) -> u32 {
        match self {
            TargetCodec::Ac3 => 6,
            TargetCodec::Opus | TargetCodec::Aac | TargetCodec::Flac => 8,
        }
    }

    /// Whether a bitrate setting applies to this codec
    pub fn is_lossless(&self) -> bool {
        matches!(self, TargetCodec::Flac)
    }
}

impl std::fmt::Display for TargetCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.codec_name())
    }
}

impl FromStr for TargetCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "opus" | "libopus" => Ok(TargetCodec::Opus),
            "aac" => Ok(TargetCodec::Aac),
            "flac" => Ok(TargetCodec::Flac),
            "ac3" | "ac-3" => Ok(TargetCodec::Ac3),
            other => Err(format!("unknown target codec '{}'", other)),
        }
    }
}

/// Loudness target configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Target integrated loudness in LUFS (default -23)
    #[serde(default = "default_integrated_lufs")]
    pub integrated_lufs: f64,
    /// True-peak ceiling in dBTP (default -1)
    #[serde(default = "default_true_peak_dbtp")]
    pub true_peak_dbtp: f64,
    /// Streams within this many LU of the target are left alone (default 0.5)
    #[serde(default = "default_tolerance_lu")]
    pub tolerance_lu: f64,
    /// Gains smaller than this after peak clamping are not worth a re-encode (default 0.1)
    #[serde(default = "default_min_gain_db")]
    pub min_gain_db: f64,
}

fn default_integrated_lufs() -> f64 {
    -23.0
}

fn default_true_peak_dbtp() -> f64 {
    -1.0
}

fn default_tolerance_lu() -> f64 {
    0.5
}

fn default_min_gain_db() -> f64 {
    0.1
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            integrated_lufs: default_integrated_lufs(),
            true_peak_dbtp: default_true_peak_dbtp(),
            tolerance_lu: default_tolerance_lu(),
            min_gain_db: default_min_gain_db(),
        }
    }
}

/// Audio encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EncoderConfig {
    /// Codec for re-encoded streams (default opus)
    #[serde(default)]
    pub codec: TargetCodec,
    /// Bitrate in kbps (codec default if None)
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Fold 5.1/7.1 streams down to stereo when re-encoding
    #[serde(default)]
    pub downmix_stereo: bool,
}

/// Per-stream worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConcurrencyConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Maximum audio streams processed at once (0 = auto-derive)
    #[serde(default)]
    pub max_parallel_streams: u32,
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Parent directory for run-scoped temp directories (system temp if None)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            temp_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - NORMALIZER_TARGET_LUFS -> target.integrated_lufs
    /// - NORMALIZER_TRUE_PEAK_DBTP -> target.true_peak_dbtp
    /// - NORMALIZER_TOLERANCE_LU -> target.tolerance_lu
    /// - NORMALIZER_MIN_GAIN_DB -> target.min_gain_db
    /// - NORMALIZER_CODEC -> encoder.codec
    /// - NORMALIZER_BITRATE_KBPS -> encoder.bitrate_kbps
    /// - NORMALIZER_DOWNMIX_STEREO -> encoder.downmix_stereo
    /// - NORMALIZER_LOGICAL_CORES -> concurrency.logical_cores
    /// - NORMALIZER_MAX_PARALLEL_STREAMS -> concurrency.max_parallel_streams
    /// - NORMALIZER_FFMPEG / NORMALIZER_FFPROBE / NORMALIZER_TEMP_DIR -> tools.*
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<f64>("NORMALIZER_TARGET_LUFS") {
            self.target.integrated_lufs = v;
        }
        if let Some(v) = env_parse::<f64>("NORMALIZER_TRUE_PEAK_DBTP") {
            self.target.true_peak_dbtp = v;
        }
        if let Some(v) = env_parse::<f64>("NORMALIZER_TOLERANCE_LU") {
            self.target.tolerance_lu = v;
        }
        if let Some(v) = env_parse::<f64>("NORMALIZER_MIN_GAIN_DB") {
            self.target.min_gain_db = v;
        }

        if let Some(codec) = env_parse::<TargetCodec>("NORMALIZER_CODEC") {
            self.encoder.codec = codec;
        }
        if let Some(kbps) = env_parse::<u32>("NORMALIZER_BITRATE_KBPS") {
            self.encoder.bitrate_kbps = Some(kbps);
        }
        if let Ok(val) = env::var("NORMALIZER_DOWNMIX_STEREO") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.downmix_stereo = true,
                "false" | "0" | "no" => self.encoder.downmix_stereo = false,
                _ => {}
            }
        }

        if let Some(cores) = env_parse::<u32>("NORMALIZER_LOGICAL_CORES") {
            self.concurrency.logical_cores = Some(cores);
        }
        if let Some(n) = env_parse::<u32>("NORMALIZER_MAX_PARALLEL_STREAMS") {
            self.concurrency.max_parallel_streams = n;
        }

        if let Ok(val) = env::var("NORMALIZER_FFMPEG") {
            if !val.is_empty() {
                self.tools.ffmpeg = PathBuf::from(val);
            }
        }
        if let Ok(val) = env::var("NORMALIZER_FFPROBE") {
            if !val.is_empty() {
                self.tools.ffprobe = PathBuf::from(val);
            }
        }
        if let Ok(val) = env::var("NORMALIZER_TEMP_DIR") {
            if !val.is_empty() {
                self.tools.temp_dir = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
