//! Movie Normalizer
//!
//! Measures every audio stream of a movie container, re-encodes the streams
//! that miss the loudness target with a fixed gain, and remuxes the result
//! with all other streams, chapters and metadata carried over unchanged.

pub mod concurrency;
pub mod context;
pub mod encode;
pub mod loudness;
pub mod media;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod remux;
pub mod startup;
pub mod toolkit;

#[cfg(test)]
mod fake_toolkit;

pub use movie_normalizer_config as config;
pub use movie_normalizer_config::{Config, TargetCodec};
pub use concurrency::WorkerPlan;
pub use context::RunContext;
pub use encode::{EncodeError, EncodedAudioArtifact};
pub use loudness::{AnalysisError, LoudnessMeasurement, MEASUREMENT_EPSILON};
pub use media::{Chapter, MediaContainer, Stream, StreamKind};
pub use output::default_output_path;
pub use pipeline::{
    ErrorKind, PipelineCoordinator, PipelineError, PipelineOutcome, PipelineState, RunReport,
};
pub use plan::{NormalizationPlan, PlanAction, PlanningError, TargetProfile};
pub use probe::ProbeError;
pub use remux::{OutputContainer, RemuxError};
pub use startup::{run_startup_checks, StartupError};
pub use toolkit::{FfmpegToolkit, MediaToolkit};
