//! Batch expansion: local paths in, transfer jobs out
//!
//! A batch is a set of files and directories picked by the caller.
//! Directories are walked recursively; every discovered file becomes one
//! [`TransferJob`] targeting the mirrored remote path. The plan also carries
//! the remote directory set, ordered shallow-to-deep, so the caller can
//! pre-create the tree on its control connection before dispatch begins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{FerryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Dispatched,
    InFlight,
    Succeeded,
    Failed,
    Retrying,
    PermanentlyFailed,
}

/// One logical file upload, tracked end-to-end by the orchestrator.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: Uuid,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Size declared at batch-expansion time; also the chunking decision input.
    pub size: u64,
    pub state: JobState,
    pub retries: u32,
}

impl TransferJob {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>, size: u64) -> Self {
        TransferJob {
            id: Uuid::new_v4(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            size,
            state: JobState::Queued,
            retries: 0,
        }
    }

    /// Final component of the remote path.
    pub fn file_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
    }
}

/// Join remote path segments with '/', tolerating a trailing slash on `base`.
pub fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Parent directory of a remote path ("" when there is none).
pub fn remote_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// An expanded batch: the jobs plus the remote directories they need.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub jobs: Vec<TransferJob>,
    /// Shallow-to-deep, so CreateDir calls can run in order.
    pub dirs: Vec<String>,
}

impl BatchPlan {
    pub fn total_bytes(&self) -> u64 {
        self.jobs.iter().map(|j| j.size).sum()
    }
}

/// Expand `sources` into a job list under `remote_base`.
///
/// Files map to `remote_base/<file name>`; a directory maps its whole tree to
/// `remote_base/<dir name>/...`. A missing source is an immediate error -
/// better to find out before any byte moves.
pub fn expand(sources: &[PathBuf], remote_base: &str) -> Result<BatchPlan> {
    let mut jobs = Vec::new();
    let mut dirs = BTreeSet::new();
    dirs.insert(remote_base.trim_end_matches('/').to_string());

    for source in sources {
        let meta = std::fs::metadata(source).map_err(|e| {
            FerryError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", source.display(), e),
            ))
        })?;
        if meta.is_file() {
            let name = file_name_of(source)?;
            jobs.push(TransferJob::new(
                source.clone(),
                join_remote(remote_base, &name),
                meta.len(),
            ));
        } else if meta.is_dir() {
            let dir_name = file_name_of(source)?;
            let remote_root = join_remote(remote_base, &dir_name);
            dirs.insert(remote_root.clone());
            for entry in WalkDir::new(source).min_depth(1) {
                let entry = entry.map_err(|e| {
                    FerryError::Io(std::io::Error::other(format!(
                        "walking {}: {}",
                        source.display(),
                        e
                    )))
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(source)
                    .expect("walkdir yields paths under its root");
                let rel_remote = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let remote = join_remote(&remote_root, &rel_remote);
                if entry.file_type().is_dir() {
                    dirs.insert(remote);
                } else if entry.file_type().is_file() {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    jobs.push(TransferJob::new(entry.path(), remote, size));
                }
                // Symlinks and specials are skipped; the device has no
                // representation for them
            }
        }
    }

    let mut dirs: Vec<String> = dirs.into_iter().filter(|d| !d.is_empty()).collect();
    dirs.sort_by_key(|d| (d.matches('/').count(), d.clone()));
    Ok(BatchPlan { jobs, dirs })
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            FerryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            ))
        })
}
