//! Pipeline coordinator.
//!
//! Runs Prober → LoudnessAnalyzer → NormalizationPlanner → AudioEncoder →
//! Remuxer for one input file. Measurement and encoding run per audio stream
//! on a bounded worker pool; the first failure aborts every sibling and the
//! run fails as a whole. All intermediate files live in the run's
//! [`RunContext`] and disappear with it.

use crate::concurrency::WorkerPlan;
use crate::context::RunContext;
use crate::encode::{encode, EncodeError, EncodedAudioArtifact};
use crate::loudness::{measure, AnalysisError, LoudnessMeasurement};
use crate::plan::{plan, NormalizationPlan, PlanningError, TargetProfile};
use crate::probe::{probe, ProbeError};
use crate::remux::{prepare_destination, remux, RemuxError};
use crate::startup::StartupError;
use crate::toolkit::MediaToolkit;
use movie_normalizer_config::Config;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Pipeline state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Probing,
    Analyzing,
    Planning,
    Encoding,
    Remuxing,
    Done,
    /// Terminal failure with the error message
    Failed(String),
}

impl PipelineState {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Probing => "probing",
            PipelineState::Analyzing => "analyzing",
            PipelineState::Planning => "planning",
            PipelineState::Encoding => "encoding",
            PipelineState::Remuxing => "remuxing",
            PipelineState::Done => "done",
            PipelineState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

/// Stage a pipeline failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Startup,
    Context,
    Probe,
    Analysis,
    Planning,
    Encode,
    Remux,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Startup => "startup",
            ErrorKind::Context => "context",
            ErrorKind::Probe => "probe",
            ErrorKind::Analysis => "analysis",
            ErrorKind::Planning => "planning",
            ErrorKind::Encode => "encode",
            ErrorKind::Remux => "remux",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Failed to create run context: {0}")]
    Context(#[source] std::io::Error),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Remux failed: {0}")]
    Remux(#[from] RemuxError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Startup(_) => ErrorKind::Startup,
            PipelineError::Context(_) => ErrorKind::Context,
            PipelineError::Probe(_) => ErrorKind::Probe,
            PipelineError::Analysis(_) => ErrorKind::Analysis,
            PipelineError::Planning(_) => ErrorKind::Planning,
            PipelineError::Encode(_) => ErrorKind::Encode,
            PipelineError::Remux(_) => ErrorKind::Remux,
        }
    }
}

/// Result of a pipeline run as seen by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Success(PathBuf),
    Failure { kind: ErrorKind, message: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }
}

impl From<Result<RunReport, PipelineError>> for PipelineOutcome {
    fn from(result: Result<RunReport, PipelineError>) -> Self {
        match result {
            Ok(report) => PipelineOutcome::Success(report.output),
            Err(e) => PipelineOutcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Details of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub output: PathBuf,
    /// Measurements ordered by stream index.
    pub measurements: Vec<LoudnessMeasurement>,
    /// Plans ordered by stream index.
    pub plans: Vec<NormalizationPlan>,
    /// Every state the run passed through, `Idle` first.
    pub states: Vec<PipelineState>,
}

/// Records and logs state transitions of one run.
#[derive(Debug)]
struct StateLog {
    states: Vec<PipelineState>,
}

impl StateLog {
    fn new() -> Self {
        Self {
            states: vec![PipelineState::Idle],
        }
    }

    fn current(&self) -> &PipelineState {
        // Never empty: starts with Idle
        &self.states[self.states.len() - 1]
    }

    fn enter(&mut self, next: PipelineState) {
        info!(from = self.current().as_str(), to = next.as_str(), "pipeline state");
        self.states.push(next);
    }
}

/// Drives one input file through the whole pipeline.
pub struct PipelineCoordinator<T: MediaToolkit> {
    toolkit: Arc<T>,
    profile: TargetProfile,
    workers: WorkerPlan,
    temp_base: Option<PathBuf>,
}

impl<T: MediaToolkit> PipelineCoordinator<T> {
    pub fn new(toolkit: Arc<T>, profile: TargetProfile, workers: WorkerPlan) -> Self {
        Self {
            toolkit,
            profile,
            workers,
            temp_base: None,
        }
    }

    /// Coordinator using the profile, worker bound and temp base of `cfg`.
    pub fn from_config(toolkit: Arc<T>, cfg: &Config) -> Self {
        Self {
            toolkit,
            profile: TargetProfile::from(cfg),
            workers: WorkerPlan::derive(cfg),
            temp_base: cfg.tools.temp_dir.clone(),
        }
    }

    /// Create run temp directories under `base` instead of the system temp dir.
    pub fn with_temp_base(mut self, base: PathBuf) -> Self {
        self.temp_base = Some(base);
        self
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    pub fn workers(&self) -> &WorkerPlan {
        &self.workers
    }

    /// Run the pipeline and reduce the result to an outcome.
    pub async fn run(&self, input: &Path, output: &Path) -> PipelineOutcome {
        self.run_report(input, output).await.into()
    }

    /// Run the pipeline, returning the full report on success.
    ///
    /// On failure nothing is written to `output` (an existing file there is
    /// left as it was) and the run's temp directory is removed.
    pub async fn run_report(&self, input: &Path, output: &Path) -> Result<RunReport, PipelineError> {
        let mut states = StateLog::new();
        let result = self.execute(&mut states, input, output).await;
        if let Err(e) = &result {
            error!(
                from = states.current().as_str(),
                kind = %e.kind(),
                error = %e,
                input = %input.display(),
                "pipeline failed"
            );
            states.enter(PipelineState::Failed(e.to_string()));
        }
        result
    }

    async fn execute(
        &self,
        states: &mut StateLog,
        input: &Path,
        output: &Path,
    ) -> Result<RunReport, PipelineError> {
        self.profile.validate()?;

        let ctx = Arc::new(RunContext::new(self.temp_base.as_deref()).map_err(PipelineError::Context)?);
        let span = info_span!("run", run_id = %ctx.run_id());

        async move {
            info!(
                input = %input.display(),
                output = %output.display(),
                temp_dir = %ctx.temp_dir().display(),
                "starting run"
            );

            states.enter(PipelineState::Probing);
            let container = Arc::new(probe(self.toolkit.as_ref(), input).await?);
            prepare_destination(&container.path, output)?;

            let audio = container.audio_indices();
            let workers = self.workers.workers_for(audio.len());
            debug!(audio_streams = audio.len(), workers, "worker bound");

            states.enter(PipelineState::Analyzing);
            let downmix = self.profile.downmix_stereo;
            let measurements = run_per_stream(&audio, workers, |stream_index| {
                let toolkit = Arc::clone(&self.toolkit);
                let container = Arc::clone(&container);
                async move { measure(toolkit.as_ref(), &container, stream_index, downmix).await }
            })
            .await?;

            states.enter(PipelineState::Planning);
            let plans = plan(&container, &measurements, &self.profile)?;

            states.enter(PipelineState::Encoding);
            let re_encode: Vec<usize> = plans
                .iter()
                .filter(|p| p.is_re_encode())
                .map(|p| p.stream_index)
                .collect();
            let artifacts: Vec<EncodedAudioArtifact> =
                run_per_stream(&re_encode, workers, |stream_index| {
                    let toolkit = Arc::clone(&self.toolkit);
                    let container = Arc::clone(&container);
                    let ctx = Arc::clone(&ctx);
                    let stream_plan = plans.iter().find(|p| p.stream_index == stream_index).cloned();
                    async move {
                        let stream_plan =
                            stream_plan.ok_or(EncodeError::StreamNotFound(stream_index))?;
                        encode(toolkit.as_ref(), &ctx, &container, stream_index, &stream_plan)
                            .await
                    }
                })
                .await?;

            states.enter(PipelineState::Remuxing);
            let written = remux(
                self.toolkit.as_ref(),
                &ctx,
                &container,
                &plans,
                &artifacts,
                output,
            )
            .await?;

            states.enter(PipelineState::Done);
            info!(
                output = %written.path.display(),
                re_encoded = artifacts.len(),
                passed_through = plans.len() - artifacts.len(),
                "run complete"
            );

            Ok(RunReport {
                run_id: ctx.run_id(),
                output: written.path,
                measurements,
                plans,
                states: states.states.clone(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Run `task` for every stream index with at most `workers` running at once.
///
/// Results come back ordered by stream index regardless of completion order.
/// On the first error every other task is aborted and awaited before the
/// error is returned, so no task outlives the call.
async fn run_per_stream<R, E, F, Fut>(
    indices: &[usize],
    workers: usize,
    task: F,
) -> Result<Vec<R>, E>
where
    R: Send + 'static,
    E: From<JoinError> + Send + 'static,
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for &stream_index in indices {
        let semaphore = Arc::clone(&semaphore);
        let work = task(stream_index);
        set.spawn(async move {
            // The semaphore is never closed; a failed acquire only drops the bound.
            let _permit = semaphore.acquire_owned().await.ok();
            (stream_index, work.await)
        });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((stream_index, Ok(result))) => {
                results.insert(stream_index, result);
                continue;
            }
            Ok((stream_index, Err(e))) => {
                debug!(stream = stream_index, "stream task failed, aborting siblings");
                e
            }
            Err(join_error) => E::from(join_error),
        };

        set.abort_all();
        while set.join_next().await.is_some() {}
        return Err(failure);
    }

    Ok(results.into_values().collect())
}
