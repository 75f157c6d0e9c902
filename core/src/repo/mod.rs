//! Repository mutation.
//!
//! [`RepoMutator`] owns the local checkout: it prepares the run branch,
//! applies a [`PatchSet`] atomically as one commit and pushes the branch.

pub mod git;
pub mod lock;

pub use git::FileChange;
pub use lock::BranchLock;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::patch::{content_digest, FileOperation, FileSource, OperationKind, PatchSet, RepoPath};
use crate::secrets::Secret;

/// A commit created by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub branch: String,
    pub sha: String,
    pub paths: Vec<PathBuf>,
}

/// The checkout as seen by the patch synthesizer.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSource for WorkingTree {
    fn read(&self, path: &RepoPath) -> Option<String> {
        let bytes = fs::read(path.resolve(&self.root)).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// One operation with its preconditions checked and its result computed.
struct PlannedWrite {
    path: RepoPath,
    target: PathBuf,
    original: Option<Vec<u8>>,
    updated: Option<String>,
}

/// Everything needed to put the tree back the way it was.
#[derive(Default)]
struct Journal {
    backups: Vec<(PathBuf, Option<Vec<u8>>)>,
    created_dirs: Vec<PathBuf>,
    staged: Vec<String>,
}

/// Applies patches to a local git checkout.
#[derive(Debug, Clone)]
pub struct RepoMutator {
    root: PathBuf,
    lock_timeout: Duration,
    remote: Option<String>,
    token: Option<Secret>,
}

impl RepoMutator {
    /// Opens the checkout containing `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let root = git::toplevel(dir)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            lock_timeout: Duration::from_secs(60),
            remote: None,
            token: None,
        })
    }

    /// Opens the configured working directory with the configured remote and token.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Ok(Self::open(&config.workdir)?
            .with_lock_timeout(config.tuning.run.lock_timeout())
            .with_remote(config.tuning.run.remote.clone())
            .with_token(config.github_token.clone()))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the remote to fetch from and push to. `None` keeps everything local.
    pub fn with_remote(mut self, remote: Option<String>) -> Self {
        self.remote = remote.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_token(mut self, token: Secret) -> Self {
        self.token = Some(token);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn working_tree(&self) -> WorkingTree {
        WorkingTree::new(&self.root)
    }

    pub fn head_sha(&self) -> Result<String> {
        git::rev_parse(&self.root, "HEAD")
    }

    /// `-c http.extraheader=...` arguments when a token is configured.
    fn auth_args(&self) -> Vec<String> {
        match &self.token {
            Some(token) => vec!["-c".to_string(), git::auth_config(token)],
            None => Vec::new(),
        }
    }

    fn run_remote(&self, args: &[&str]) -> Result<String> {
        let auth = self.auth_args();
        let mut full: Vec<&str> = auth.iter().map(String::as_str).collect();
        full.extend_from_slice(args);
        git::run(&self.root, &full)
    }

    /// The remote, if it is configured and actually exists in the checkout.
    fn usable_remote(&self) -> Result<Option<&str>> {
        match self.remote.as_deref() {
            Some(remote) if git::has_remote(&self.root, remote)? => Ok(Some(remote)),
            Some(remote) => {
                tracing::warn!(remote = %remote, "configured remote not found, staying local");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Checks out `branch`, creating it from `base` when needed.
    ///
    /// An existing local or remote run branch is reused so that retries
    /// stack on earlier attempts.
    pub fn prepare_branch(&self, branch: &str, base: &str) -> Result<()> {
        let remote = self.usable_remote()?;

        if let Some(remote) = remote {
            if let Err(e) = self.run_remote(&["fetch", "--quiet", remote, base]) {
                tracing::warn!(remote = %remote, base = %base, error = %e, "fetching base branch failed");
            }
            if self.run_remote(&["fetch", "--quiet", remote, branch]).is_ok() {
                tracing::debug!(branch = %branch, "fetched existing run branch");
            }
        }

        if git::current_branch(&self.root).ok().as_deref() == Some(branch) {
            tracing::info!(branch = %branch, "already on run branch");
            return Ok(());
        }

        if git::local_branch_exists(&self.root, branch)? {
            git::run(&self.root, &["checkout", "--quiet", branch])?;
            tracing::info!(branch = %branch, "checked out existing branch");
            return Ok(());
        }

        if let Some(remote) = remote {
            if git::remote_branch_exists(&self.root, remote, branch)? {
                let start = format!("{}/{}", remote, branch);
                git::run(&self.root, &["checkout", "--quiet", "-b", branch, &start])?;
                tracing::info!(branch = %branch, start = %start, "checked out remote branch");
                return Ok(());
            }
        }

        let start = match remote {
            Some(remote) if git::remote_branch_exists(&self.root, remote, base)? => {
                format!("{}/{}", remote, base)
            }
            _ if git::local_branch_exists(&self.root, base)? => base.to_string(),
            _ => {
                return Err(Error::Git(format!("base branch {} not found", base)));
            }
        };

        git::run(&self.root, &["checkout", "--quiet", "-b", branch, &start])?;
        tracing::info!(branch = %branch, start = %start, "created branch");
        Ok(())
    }

    /// Fails unless `target` resolves inside the checkout, following symlinks.
    fn ensure_contained(&self, path: &RepoPath, target: &Path) -> Result<()> {
        let mut probe = target;
        while probe.symlink_metadata().is_err() {
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        let resolved = probe.canonicalize()?;
        if !resolved.starts_with(&self.root) {
            return Err(Error::ApplyConflict {
                path: path.to_path_buf(),
                reason: "path resolves outside the repository".to_string(),
            });
        }
        Ok(())
    }

    /// Checks one operation's preconditions and computes its result.
    fn plan(&self, op: &FileOperation) -> Result<PlannedWrite> {
        let conflict = |reason: String| Error::ApplyConflict {
            path: op.path.to_path_buf(),
            reason,
        };

        if let Some(reason) = op.conflict_reason() {
            return Err(conflict(reason.to_string()));
        }

        let target = op.path.resolve(&self.root);
        self.ensure_contained(&op.path, &target)?;

        let original = if target.is_file() {
            Some(fs::read(&target)?)
        } else if target.exists() {
            return Err(conflict("path exists and is not a regular file".to_string()));
        } else {
            None
        };

        match (&op.kind, &original) {
            (OperationKind::Create { .. }, Some(_)) => {
                return Err(conflict("file already exists".to_string()));
            }
            (OperationKind::Modify { .. } | OperationKind::Delete, None) => {
                return Err(conflict("file does not exist".to_string()));
            }
            _ => {}
        }

        let current = original
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

        if let (Some(expected), Some(current)) = (&op.base_digest, &current) {
            if content_digest(current) != *expected {
                return Err(conflict(
                    "file changed since the patch was computed".to_string(),
                ));
            }
        }

        let updated = op.render(current.as_deref()).map_err(conflict)?;

        Ok(PlannedWrite {
            path: op.path.clone(),
            target,
            original,
            updated,
        })
    }

    /// Applies `patch` on `branch` as a single commit.
    ///
    /// Every precondition is checked before the tree is touched. If anything
    /// fails after that, touched files are restored, created files and
    /// directories are removed and the index is reset, so the tree ends as it
    /// started.
    pub fn apply(&self, patch: &PatchSet, branch: &str, message: &str) -> Result<CommitRef> {
        if patch.is_empty() {
            return Err(Error::Git("refusing to commit an empty patch".to_string()));
        }

        let checked_out = git::current_branch(&self.root)?;
        if checked_out != branch {
            return Err(Error::Git(format!(
                "expected branch {} to be checked out, found {}",
                branch, checked_out
            )));
        }

        let git_dir = git::git_dir(&self.root)?;
        let _lock = BranchLock::acquire(&git_dir, branch, self.lock_timeout)?;

        let plan = patch
            .iter()
            .map(|op| self.plan(op))
            .collect::<Result<Vec<_>>>()?;

        let mut journal = Journal::default();
        match self.write_and_commit(&plan, &mut journal, message) {
            Ok(sha) => {
                let paths: Vec<PathBuf> = plan.iter().map(|p| p.path.to_path_buf()).collect();
                tracing::info!(branch = %branch, sha = %sha, files = paths.len(), "committed patch");
                Ok(CommitRef {
                    branch: branch.to_string(),
                    sha,
                    paths,
                })
            }
            Err(e) => {
                tracing::warn!(branch = %branch, error = %e, "apply failed, restoring working tree");
                self.rollback(journal);
                Err(e)
            }
        }
    }

    fn write_and_commit(
        &self,
        plan: &[PlannedWrite],
        journal: &mut Journal,
        message: &str,
    ) -> Result<String> {
        for write in plan {
            journal
                .backups
                .push((write.target.clone(), write.original.clone()));

            match &write.updated {
                Some(content) => {
                    if let Some(parent) = write.target.parent() {
                        self.create_parents(parent, journal)?;
                    }
                    fs::write(&write.target, content)?;
                }
                None => fs::remove_file(&write.target)?,
            }
            tracing::debug!(path = %write.path, "wrote file");
        }

        let paths: Vec<&str> = plan.iter().map(|w| w.path.as_str()).collect();
        journal.staged = paths.iter().map(|p| p.to_string()).collect();

        let mut add = vec!["--literal-pathspecs", "add", "-A", "--"];
        add.extend(&paths);
        git::run(&self.root, &add)?;

        let author_name = format!("user.name={}", git::COMMIT_AUTHOR_NAME);
        let author_email = format!("user.email={}", git::COMMIT_AUTHOR_EMAIL);
        let mut commit = vec![
            "-c",
            author_name.as_str(),
            "-c",
            author_email.as_str(),
            "--literal-pathspecs",
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message,
            "--",
        ];
        commit.extend(&paths);
        git::run(&self.root, &commit)?;

        self.head_sha()
    }

    /// Creates missing ancestors of `dir`, recording each one.
    fn create_parents(&self, dir: &Path, journal: &mut Journal) -> Result<()> {
        let mut missing = Vec::new();
        let mut probe = dir;
        while probe.symlink_metadata().is_err() && probe.starts_with(&self.root) {
            missing.push(probe.to_path_buf());
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        for created in missing.into_iter().rev() {
            fs::create_dir(&created)?;
            journal.created_dirs.push(created);
        }
        Ok(())
    }

    fn rollback(&self, journal: Journal) {
        for (target, original) in journal.backups.into_iter().rev() {
            let restored = match original {
                Some(bytes) => fs::write(&target, bytes),
                None if target.is_file() => fs::remove_file(&target),
                None => Ok(()),
            };
            if let Err(e) = restored {
                tracing::error!(path = ?target, error = %e, "failed to restore file");
            }
        }

        for dir in journal.created_dirs.into_iter().rev() {
            if let Err(e) = fs::remove_dir(&dir) {
                tracing::warn!(path = ?dir, error = %e, "failed to remove created directory");
            }
        }

        if !journal.staged.is_empty() {
            let mut reset = vec!["--literal-pathspecs", "reset", "--quiet", "--"];
            reset.extend(journal.staged.iter().map(String::as_str));
            if let Err(e) = git::run(&self.root, &reset) {
                tracing::warn!(error = %e, "failed to unstage paths");
            }
        }
    }

    /// Pushes the commit's branch to the remote.
    ///
    /// Returns `false` when no remote is configured and nothing was pushed.
    pub fn push(&self, commit: &CommitRef) -> Result<bool> {
        let Some(remote) = self.usable_remote()? else {
            tracing::info!(branch = %commit.branch, "no remote configured, skipping push");
            return Ok(false);
        };

        let refspec = format!("{}:refs/heads/{}", commit.branch, commit.branch);
        self.run_remote(&["push", "--quiet", remote, &refspec])
            .map_err(|e| match e {
                Error::Git(msg) => Error::Git(format!("push to {} failed: {}", remote, msg)),
                other => other,
            })?;

        tracing::info!(remote = %remote, branch = %commit.branch, sha = %commit.sha, "pushed branch");
        Ok(true)
    }

    /// Commits on `branch` not on `base`.
    pub fn branch_commits(&self, branch: &str, base: &str) -> Result<Vec<(String, String)>> {
        git::branch_commits(&self.root, branch, &self.base_ref(base)?)
    }

    /// Files changed on `branch` relative to `base`.
    pub fn file_changes(&self, branch: &str, base: &str) -> Result<Vec<FileChange>> {
        git::file_changes(&self.root, branch, &self.base_ref(base)?)
    }

    fn base_ref(&self, base: &str) -> Result<String> {
        if let Some(remote) = self.usable_remote()? {
            if git::remote_branch_exists(&self.root, remote, base)? {
                return Ok(format!("{}/{}", remote, base));
            }
        }
        Ok(base.to_string())
    }
}
