//! Output file handling.
//!
//! The remuxer never writes to the destination directly. It writes a hidden
//! partial file next to it and renames that over the destination only after
//! the result has been verified, so an existing destination is either fully
//! replaced or left exactly as it was.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Default destination for an input: `<stem>.normalized.<ext>` next to it.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use movie_normalizer::output::default_output_path;
///
/// let out = default_output_path(Path::new("/media/movies/film.mkv"));
/// assert_eq!(out, Path::new("/media/movies/film.normalized.mkv"));
/// ```
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("output"));
    let mut name = stem;
    name.push(".normalized");
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    input.with_file_name(name)
}

/// Hidden partial path next to `destination`: `.<name>.<run-id>.partial.<ext>`.
///
/// The destination's extension is kept last so ffmpeg picks the same muxer
/// for the partial file as for the destination.
pub fn partial_path(destination: &Path, run_id: Uuid) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(
        destination
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("output")),
    );
    name.push(format!(".{}.partial", run_id.simple()));
    if let Some(ext) = destination.extension() {
        name.push(".");
        name.push(ext);
    }
    parent_dir(destination).join(name)
}

/// Directory that holds `path`; `.` for bare file names.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Whether `destination` resolves to the same file as `input`.
///
/// A destination that does not exist yet is compared through its canonical
/// parent directory.
pub fn is_same_file(input: &Path, destination: &Path) -> bool {
    let Ok(input) = input.canonicalize() else {
        return false;
    };
    if let Ok(dest) = destination.canonicalize() {
        return dest == input;
    }
    match (
        parent_dir(destination).canonicalize(),
        destination.file_name(),
    ) {
        (Ok(dir), Some(name)) => dir.join(name) == input,
        _ => false,
    }
}

/// Check that files can be created in the destination's directory.
///
/// Creates and immediately removes a hidden probe file.
pub fn check_writable(destination: &Path) -> io::Result<()> {
    let dir = parent_dir(destination);
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("directory {} does not exist", dir.display()),
        ));
    }
    let probe = tempfile::Builder::new()
        .prefix(".movie-normalizer-write-check-")
        .tempfile_in(dir)?;
    drop(probe);
    Ok(())
}

/// Guard for a partial output file.
///
/// The file is removed when the guard is dropped unless it was committed.
#[derive(Debug)]
pub struct PartialOutput {
    path: PathBuf,
    committed: bool,
}

impl PartialOutput {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically rename the partial file over `destination`.
    ///
    /// On failure the guard is consumed and the partial file removed; the
    /// destination is unchanged.
    pub async fn commit(mut self, destination: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial output");
            }
        }
    }
}
