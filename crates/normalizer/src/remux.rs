//! Remuxer: assembles the output container by stable stream index.
//!
//! Re-encoded audio streams come from their artifacts, everything else is
//! copied from the input bit for bit. The result is written to a hidden
//! partial file, re-probed and checked against the input, and only then
//! renamed over the destination.

use crate::context::RunContext;
use crate::encode::EncodedAudioArtifact;
use crate::media::MediaContainer;
use crate::output::{check_writable, is_same_file, partial_path, PartialOutput};
use crate::plan::NormalizationPlan;
use crate::probe::ProbeError;
use crate::toolkit::{MediaToolkit, MuxRequest, MuxSource, MuxStream};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Error type for remux operations
#[derive(Debug, Error)]
pub enum RemuxError {
    /// Files cannot be created next to the destination.
    #[error("Destination {path} is not writable: {reason}")]
    DestinationNotWritable { path: PathBuf, reason: String },

    /// The destination would overwrite the input.
    #[error("Destination {0} is the input file")]
    DestinationIsInput(PathBuf),

    /// Artifacts do not line up with the re-encode plans.
    #[error("Artifacts do not match plans: {0}")]
    ArtifactMismatch(String),

    /// ffmpeg exited with non-zero status
    #[error("Mux failed with exit code {code}: {message}")]
    MuxFailed { code: i32, message: String },

    /// ffmpeg was terminated by signal
    #[error("Mux was terminated by signal")]
    MuxTerminated,

    /// The written container does not match the input's structure.
    #[error("Output does not match input: {0}")]
    StreamMismatch(String),

    /// Re-probing the written container failed.
    #[error("Failed to probe output: {0}")]
    Probe(#[from] ProbeError),

    /// IO error during remux
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A written and verified output file.
#[derive(Debug, Clone)]
pub struct OutputContainer {
    pub path: PathBuf,
    pub container: MediaContainer,
}

/// Preflight for a destination: not the input, and its directory is writable.
pub fn prepare_destination(input: &Path, destination: &Path) -> Result<(), RemuxError> {
    if is_same_file(input, destination) {
        return Err(RemuxError::DestinationIsInput(destination.to_path_buf()));
    }
    check_writable(destination).map_err(|e| RemuxError::DestinationNotWritable {
        path: destination.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Build the mux request: every input stream once, in input order.
pub fn build_mux_request(
    container: &MediaContainer,
    plans: &[NormalizationPlan],
    artifacts: &[EncodedAudioArtifact],
    output: &Path,
) -> Result<MuxRequest, RemuxError> {
    let mut by_index: BTreeMap<usize, &EncodedAudioArtifact> = BTreeMap::new();
    for artifact in artifacts {
        if by_index.insert(artifact.stream_index, artifact).is_some() {
            return Err(RemuxError::ArtifactMismatch(format!(
                "stream {} has more than one artifact",
                artifact.stream_index
            )));
        }
    }

    for plan in plans {
        let has_artifact = by_index.contains_key(&plan.stream_index);
        if plan.is_re_encode() && !has_artifact {
            return Err(RemuxError::ArtifactMismatch(format!(
                "stream {} was re-encoded but has no artifact",
                plan.stream_index
            )));
        }
        if !plan.is_re_encode() && has_artifact {
            return Err(RemuxError::ArtifactMismatch(format!(
                "stream {} is pass-through but has an artifact",
                plan.stream_index
            )));
        }
    }
    if let Some(stray) = by_index
        .keys()
        .find(|idx| !plans.iter().any(|p| p.stream_index == **idx))
    {
        return Err(RemuxError::ArtifactMismatch(format!(
            "artifact for stream {} has no plan",
            stray
        )));
    }

    let streams = container
        .streams
        .iter()
        .map(|stream| {
            let source = match by_index.get(&stream.index) {
                Some(artifact) => MuxSource::Artifact(artifact.path.clone()),
                None => MuxSource::Original,
            };
            MuxStream {
                original: stream.clone(),
                source,
            }
        })
        .collect();

    Ok(MuxRequest {
        input: container.path.clone(),
        streams,
        output: output.to_path_buf(),
    })
}

/// Check a written container against the input it was assembled from.
///
/// Stream count and kind order must match, every stream keeps its language,
/// copied streams keep their codec, replaced streams carry the target codec,
/// and the chapter count is unchanged.
pub fn verify_output(
    input: &MediaContainer,
    output: &MediaContainer,
    plans: &[NormalizationPlan],
) -> Result<(), RemuxError> {
    if input.streams.len() != output.streams.len() {
        return Err(RemuxError::StreamMismatch(format!(
            "expected {} streams, found {}",
            input.streams.len(),
            output.streams.len()
        )));
    }

    for (original, written) in input.streams.iter().zip(&output.streams) {
        let idx = original.index;
        if original.kind != written.kind {
            return Err(RemuxError::StreamMismatch(format!(
                "stream {} is {} in input but {} in output",
                idx, original.kind, written.kind
            )));
        }

        let re_encoded = plans
            .iter()
            .find(|p| p.stream_index == idx)
            .filter(|p| p.is_re_encode());

        if original.language != written.language {
            return Err(RemuxError::StreamMismatch(format!(
                "stream {} language changed from {:?} to {:?}",
                idx, original.language, written.language
            )));
        }

        match re_encoded {
            Some(plan) => {
                if written.codec_name != plan.codec.codec_name() {
                    return Err(RemuxError::StreamMismatch(format!(
                        "stream {} should be {} but is {}",
                        idx, plan.codec, written.codec_name
                    )));
                }
            }
            None => {
                if written.codec_name != original.codec_name {
                    return Err(RemuxError::StreamMismatch(format!(
                        "copied stream {} changed codec from {} to {}",
                        idx, original.codec_name, written.codec_name
                    )));
                }
            }
        }
    }

    if input.chapters.len() != output.chapters.len() {
        return Err(RemuxError::StreamMismatch(format!(
            "expected {} chapters, found {}",
            input.chapters.len(),
            output.chapters.len()
        )));
    }

    Ok(())
}

/// Assemble, verify and publish the output container.
///
/// The destination is only touched by the final rename; on any error it keeps
/// its previous content (or stays absent) and the partial file is removed.
pub async fn remux<T: MediaToolkit + ?Sized>(
    toolkit: &T,
    ctx: &RunContext,
    container: &MediaContainer,
    plans: &[NormalizationPlan],
    artifacts: &[EncodedAudioArtifact],
    output_path: &Path,
) -> Result<OutputContainer, RemuxError> {
    prepare_destination(&container.path, output_path)?;

    let partial = PartialOutput::new(partial_path(output_path, ctx.run_id()));
    let request = build_mux_request(container, plans, artifacts, partial.path())?;

    info!(
        output = %output_path.display(),
        streams = request.streams.len(),
        replaced = artifacts.len(),
        "remuxing"
    );

    toolkit.mux(&request).await?;

    let written = crate::probe::probe(toolkit, partial.path()).await?;
    verify_output(container, &written, plans)?;
    debug!(partial = %partial.path().display(), "output verified");

    partial.commit(output_path).await?;
    info!(output = %output_path.display(), "output written");

    Ok(OutputContainer {
        path: output_path.to_path_buf(),
        container: MediaContainer {
            path: output_path.to_path_buf(),
            ..written
        },
    })
}
