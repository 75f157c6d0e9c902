//! Per-branch advisory lock.
//!
//! Runs touching the same branch serialize on an exclusive `fs2` lock on
//! `.git/code-agent-locks/<branch>.lock`. The lock is released when the
//! guard drops.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};

/// Directory under the git dir holding lock files.
pub const LOCK_DIR: &str = "code-agent-locks";

/// RAII guard for an exclusive branch lock.
#[derive(Debug)]
pub struct BranchLock {
    file: File,
    path: PathBuf,
}

fn lock_file_name(branch: &str) -> String {
    let safe: String = branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("{}.lock", safe)
}

impl BranchLock {
    /// Path of the lock file for `branch`.
    pub fn path_for(git_dir: &Path, branch: &str) -> PathBuf {
        git_dir.join(LOCK_DIR).join(lock_file_name(branch))
    }

    /// Acquires the lock, retrying with backoff until `timeout` elapses.
    ///
    /// Fails with [`Error::ApplyConflict`] when another holder keeps it.
    pub fn acquire(git_dir: &Path, branch: &str, timeout: Duration) -> Result<Self> {
        let path = Self::path_for(git_dir, branch);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(500));

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(branch = %branch, lock = ?path, "acquired branch lock");
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        tracing::warn!(branch = %branch, waited_ms = waited.as_millis() as u64, "branch lock timeout");
                        return Err(Error::ApplyConflict {
                            path: path.clone(),
                            reason: format!(
                                "branch {} is locked by another run (waited {:?})",
                                branch, waited
                            ),
                        });
                    }
                    let delay = backoff.step().min(timeout - waited);
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BranchLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = ?self.path, error = %e, "failed to release branch lock");
        } else {
            tracing::debug!(lock = ?self.path, "released branch lock");
        }
    }
}
