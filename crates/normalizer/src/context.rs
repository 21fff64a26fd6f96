//! Run-scoped context.
//!
//! Every pipeline run owns one [`RunContext`]. Its temp directory holds all
//! intermediate artifacts and is removed when the context is dropped, on
//! success, failure, or cancellation alike.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// State owned by a single pipeline run.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    temp_dir: TempDir,
}

impl RunContext {
    /// Create a context with a fresh temp directory under `temp_base`
    /// (the system temp directory when `None`).
    pub fn new(temp_base: Option<&Path>) -> std::io::Result<Self> {
        let run_id = Uuid::new_v4();
        let prefix = format!("movie-normalizer-{}-", run_id.simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let temp_dir = match temp_base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        Ok(Self { run_id, temp_dir })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Directory holding this run's artifacts.
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Artifact path for a re-encoded stream.
    pub fn artifact_path(&self, stream_index: usize) -> PathBuf {
        self.temp_dir.path().join(format!("stream-{}.mka", stream_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let base = TempDir::new().unwrap();
        let ctx = RunContext::new(Some(base.path())).unwrap();
        let dir = ctx.temp_dir().to_path_buf();
        std::fs::write(ctx.artifact_path(1), b"partial").unwrap();
        assert!(dir.exists());

        drop(ctx);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_artifact_paths_are_per_stream() {
        let ctx = RunContext::new(None).unwrap();
        assert_ne!(ctx.artifact_path(1), ctx.artifact_path(2));
        assert!(ctx.artifact_path(3).starts_with(ctx.temp_dir()));
        assert!(ctx
            .artifact_path(3)
            .to_string_lossy()
            .ends_with("stream-3.mka"));
    }

    #[test]
    fn test_runs_get_distinct_ids_and_dirs() {
        let a = RunContext::new(None).unwrap();
        let b = RunContext::new(None).unwrap();
        assert_ne!(a.run_id(), b.run_id());
        assert_ne!(a.temp_dir(), b.temp_dir());
    }
}
