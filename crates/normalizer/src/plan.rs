//! Normalization planner.
//!
//! Turns loudness measurements into one [`NormalizationPlan`] per audio
//! stream. Pure computation: no I/O, no tool invocation.

use crate::loudness::LoudnessMeasurement;
use crate::media::MediaContainer;
use movie_normalizer_config::{Config, TargetCodec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Error type for planning.
#[derive(Debug, Error, PartialEq)]
pub enum PlanningError {
    /// The target profile is self-contradictory or out of range.
    #[error("Invalid target profile: {0}")]
    InvalidProfile(String),

    /// Measurements do not line up one-to-one with the audio streams.
    #[error("Measurements do not match audio streams: {0}")]
    MeasurementMismatch(String),
}

/// Loudness and encoding target for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Target integrated loudness in LUFS.
    pub integrated_lufs: f64,
    /// True-peak ceiling in dBTP.
    pub true_peak_dbtp: f64,
    /// Deviation (LU) within which a stream counts as compliant.
    pub tolerance_lu: f64,
    /// Smallest gain (dB) worth a re-encode after peak clamping.
    pub min_gain_db: f64,
    pub codec: TargetCodec,
    pub bitrate_kbps: Option<u32>,
    pub downmix_stereo: bool,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TargetProfile {
    fn from(cfg: &Config) -> Self {
        Self {
            integrated_lufs: cfg.target.integrated_lufs,
            true_peak_dbtp: cfg.target.true_peak_dbtp,
            tolerance_lu: cfg.target.tolerance_lu,
            min_gain_db: cfg.target.min_gain_db,
            codec: cfg.encoder.codec,
            bitrate_kbps: cfg.encoder.bitrate_kbps,
            downmix_stereo: cfg.encoder.downmix_stereo,
        }
    }
}

impl TargetProfile {
    /// Bitrate to encode with: configured value, else the codec default.
    pub fn effective_bitrate_kbps(&self) -> Option<u32> {
        if self.codec.is_lossless() {
            None
        } else {
            self.bitrate_kbps.or(self.codec.default_bitrate_kbps())
        }
    }

    /// Reject profiles that cannot produce a meaningful plan.
    pub fn validate(&self) -> Result<(), PlanningError> {
        let values = [
            ("integrated_lufs", self.integrated_lufs),
            ("true_peak_dbtp", self.true_peak_dbtp),
            ("tolerance_lu", self.tolerance_lu),
            ("min_gain_db", self.min_gain_db),
        ];
        if let Some((name, v)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(PlanningError::InvalidProfile(format!(
                "{} must be finite, got {}",
                name, v
            )));
        }
        if self.tolerance_lu < 0.0 {
            return Err(PlanningError::InvalidProfile(format!(
                "tolerance must not be negative, got {} LU",
                self.tolerance_lu
            )));
        }
        if self.min_gain_db < 0.0 {
            return Err(PlanningError::InvalidProfile(format!(
                "minimum gain must not be negative, got {} dB",
                self.min_gain_db
            )));
        }
        if self.true_peak_dbtp > 0.0 {
            return Err(PlanningError::InvalidProfile(format!(
                "true-peak ceiling must be at most 0 dBTP, got {}",
                self.true_peak_dbtp
            )));
        }
        if self.integrated_lufs >= 0.0 {
            return Err(PlanningError::InvalidProfile(format!(
                "target loudness must be below 0 LUFS, got {}",
                self.integrated_lufs
            )));
        }
        if self.bitrate_kbps == Some(0) {
            return Err(PlanningError::InvalidProfile(
                "bitrate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// What happens to an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Apply gain and encode to the target codec.
    ReEncode,
    /// Copy the original stream unmodified.
    PassThrough,
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanAction::ReEncode => write!(f, "re_encode"),
            PlanAction::PassThrough => write!(f, "pass_through"),
        }
    }
}

/// Per-stream normalization decision, keyed by stable stream index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationPlan {
    pub stream_index: usize,
    pub action: PlanAction,
    /// Gain in dB applied when re-encoding (0 for pass-through).
    pub gain_db: f64,
    /// Whether the gain was reduced to respect the true-peak ceiling.
    pub clamped: bool,
    /// Fold to stereo while re-encoding.
    pub downmix_stereo: bool,
    pub codec: TargetCodec,
    pub bitrate_kbps: Option<u32>,
}

impl NormalizationPlan {
    pub fn is_re_encode(&self) -> bool {
        self.action == PlanAction::ReEncode
    }
}

/// Gain needed to reach the target, limited by the true-peak ceiling.
///
/// Returns `(gain_db, clamped)`. The result never lets `true_peak + gain`
/// exceed the ceiling.
pub fn compute_gain(measurement: &LoudnessMeasurement, profile: &TargetProfile) -> (f64, bool) {
    let wanted = profile.integrated_lufs - measurement.integrated_lufs;
    let max_safe = profile.true_peak_dbtp - measurement.true_peak_dbtp;
    if wanted > max_safe {
        (max_safe, true)
    } else {
        (wanted, false)
    }
}

/// Build one plan per audio stream of `container`.
///
/// Rules, in order:
/// 1. A stream that must be downmixed is always re-encoded.
/// 2. A stream whose true peak is above the ceiling is re-encoded with the
///    clamped (negative) gain, however close its loudness is to the target.
/// 3. A stream whose loudness is within tolerance of the target is passed through.
/// 4. A stream whose peak-clamped gain is below the minimum useful gain is passed through.
/// 5. Everything else is re-encoded with the computed gain.
///
/// The result is ordered by stream index.
pub fn plan(
    container: &MediaContainer,
    measurements: &[LoudnessMeasurement],
    profile: &TargetProfile,
) -> Result<Vec<NormalizationPlan>, PlanningError> {
    profile.validate()?;

    let mut by_index: BTreeMap<usize, &LoudnessMeasurement> = BTreeMap::new();
    for m in measurements {
        match container.stream(m.stream_index) {
            Some(s) if s.is_audio() => {}
            Some(_) => {
                return Err(PlanningError::MeasurementMismatch(format!(
                    "stream {} is not audio",
                    m.stream_index
                )))
            }
            None => {
                return Err(PlanningError::MeasurementMismatch(format!(
                    "stream {} does not exist",
                    m.stream_index
                )))
            }
        }
        if by_index.insert(m.stream_index, m).is_some() {
            return Err(PlanningError::MeasurementMismatch(format!(
                "stream {} measured twice",
                m.stream_index
            )));
        }
    }

    let mut plans = Vec::new();
    for stream in container.audio_streams() {
        let measurement = by_index.get(&stream.index).ok_or_else(|| {
            PlanningError::MeasurementMismatch(format!("stream {} was not measured", stream.index))
        })?;

        let needs_downmix = profile.downmix_stereo && stream.channels.unwrap_or(2) > 2;
        let deviation = profile.integrated_lufs - measurement.integrated_lufs;
        let (gain_db, clamped) = compute_gain(measurement, profile);

        let peak_ok = measurement.true_peak_dbtp <= profile.true_peak_dbtp;
        let compliant = peak_ok && deviation.abs() <= profile.tolerance_lu;
        let negligible = peak_ok && clamped && gain_db.abs() < profile.min_gain_db;

        let (action, gain_db) = if needs_downmix {
            (PlanAction::ReEncode, if compliant { 0.0 } else { gain_db })
        } else if compliant || negligible {
            (PlanAction::PassThrough, 0.0)
        } else {
            (PlanAction::ReEncode, gain_db)
        };

        info!(
            stream = stream.index,
            action = %action,
            gain_db,
            clamped,
            deviation_lu = deviation,
            "planned stream"
        );

        plans.push(NormalizationPlan {
            stream_index: stream.index,
            action,
            gain_db,
            clamped: clamped && action == PlanAction::ReEncode,
            downmix_stereo: needs_downmix,
            codec: profile.codec,
            bitrate_kbps: profile.effective_bitrate_kbps(),
        });
    }

    Ok(plans)
}
