//! Thin wrappers around the `git` command line.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};
use crate::secrets::Secret;

/// Identity used for agent commits.
pub const COMMIT_AUTHOR_NAME: &str = "github-actions[bot]";
pub const COMMIT_AUTHOR_EMAIL: &str = "actions@github.com";

/// A file changed on a branch, with line counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub additions: u32,
    pub deletions: u32,
}

/// The first argument that is not a `-c key=value` pair, for error messages.
fn subcommand<'a>(args: &[&'a str]) -> &'a str {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if *arg == "-c" {
            iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            return arg;
        }
    }
    "git"
}

/// Runs git in `dir` and returns the raw output, whatever the exit status.
pub(crate) fn output(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new("git").current_dir(dir).args(args).output()?)
}

/// Runs git in `dir`, failing on a non-zero exit. Returns trimmed stdout.
pub(crate) fn run(dir: &Path, args: &[&str]) -> Result<String> {
    let out = output(dir, args)?;
    if !out.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            subcommand(args),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// True when git exits successfully.
pub(crate) fn succeeds(dir: &Path, args: &[&str]) -> Result<bool> {
    Ok(output(dir, args)?.status.success())
}

/// `-c http.extraheader=...` carrying a GitHub token.
///
/// Passing the header per command keeps the token out of `.git/config`.
pub(crate) fn auth_config(token: &Secret) -> String {
    let credentials = BASE64.encode(format!("x-access-token:{}", token.expose()));
    format!("http.extraheader=AUTHORIZATION: basic {}", credentials)
}

pub fn toplevel(dir: &Path) -> Result<PathBuf> {
    run(dir, &["rev-parse", "--show-toplevel"]).map(PathBuf::from)
}

/// Absolute path of the repository's git directory.
pub fn git_dir(dir: &Path) -> Result<PathBuf> {
    let raw = PathBuf::from(run(dir, &["rev-parse", "--git-dir"])?);
    Ok(if raw.is_absolute() { raw } else { dir.join(raw) })
}

pub fn current_branch(dir: &Path) -> Result<String> {
    run(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn rev_parse(dir: &Path, rev: &str) -> Result<String> {
    run(dir, &["rev-parse", "--verify", "--quiet", rev])
}

pub fn local_branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    succeeds(
        dir,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
    )
}

pub fn remote_branch_exists(dir: &Path, remote: &str, branch: &str) -> Result<bool> {
    succeeds(
        dir,
        &[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/remotes/{}/{}", remote, branch),
        ],
    )
}

pub fn has_remote(dir: &Path, remote: &str) -> Result<bool> {
    let remotes = run(dir, &["remote"])?;
    Ok(remotes.lines().any(|r| r.trim() == remote))
}

/// Commits on `branch` that are not on `base`, as (hash, subject) pairs.
pub fn branch_commits(dir: &Path, branch: &str, base: &str) -> Result<Vec<(String, String)>> {
    let log = run(dir, &["log", "--oneline", &format!("{}..{}", base, branch)])?;
    Ok(log
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (hash, message) = line.split_once(' ').unwrap_or((line, ""));
            (hash.to_string(), message.to_string())
        })
        .collect())
}

/// Files changed between `base` and `branch` with line counts.
pub fn file_changes(dir: &Path, branch: &str, base: &str) -> Result<Vec<FileChange>> {
    let stat = run(dir, &["diff", "--numstat", &format!("{}...{}", base, branch)])?;
    Ok(parse_numstat(&stat))
}

fn parse_numstat(stat: &str) -> Vec<FileChange> {
    stat.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next()?;
            let deletions = parts.next()?;
            let path = parts.next()?;
            // Binary files report "-" for both counts.
            Some(FileChange {
                path: PathBuf::from(path),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommand_skips_config_pairs() {
        assert_eq!(subcommand(&["-c", "http.extraheader=x", "push", "origin"]), "push");
        assert_eq!(subcommand(&["--literal-pathspecs", "add", "-A"]), "add");
        assert_eq!(subcommand(&[]), "git");
    }

    #[test]
    fn auth_config_encodes_token() {
        let header = auth_config(&Secret::new("GITHUB_TOKEN", "ghs_abc"));
        assert!(header.starts_with("http.extraheader=AUTHORIZATION: basic "));
        assert!(!header.contains("ghs_abc"));
        assert!(header.ends_with(&BASE64.encode("x-access-token:ghs_abc")));
    }

    #[test]
    fn numstat_parsing() {
        let changes = parse_numstat("3\t1\tindex.html\n-\t-\tlogo.png\n");
        assert_eq!(
            changes,
            vec![
                FileChange {
                    path: PathBuf::from("index.html"),
                    additions: 3,
                    deletions: 1,
                },
                FileChange {
                    path: PathBuf::from("logo.png"),
                    additions: 0,
                    deletions: 0,
                },
            ]
        );
    }
}
