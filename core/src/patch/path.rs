//! Repository-relative paths.
//!
//! A [`RepoPath`] can only be built through [`RepoPath::parse`], which
//! normalizes the input lexically and refuses anything that would resolve
//! outside the checkout root or into git's own metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' is absolute")]
    Absolute(String),
    #[error("path '{0}' escapes the repository root")]
    Escapes(String),
    #[error("path '{0}' points into .git")]
    GitMetadata(String),
    #[error("path '{0}' contains a control character")]
    InvalidCharacter(String),
}

/// A normalized, `/`-separated path strictly inside the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoPath(String);

impl RepoPath {
    /// Normalizes `raw` and checks it against the containment rule.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw
            .trim()
            .trim_matches(|c| c == '`' || c == '"' || c == '\'');

        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(PathError::InvalidCharacter(trimmed.to_string()));
        }

        let unified = trimmed.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(PathError::Absolute(trimmed.to_string()));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in unified.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(PathError::Escapes(trimmed.to_string()));
                    }
                }
                other => {
                    if other.eq_ignore_ascii_case(".git") {
                        return Err(PathError::GitMetadata(trimmed.to_string()));
                    }
                    parts.push(other);
                }
            }
        }

        if parts.is_empty() {
            return Err(PathError::Empty);
        }

        Ok(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path relative to the repository root.
    pub fn to_path_buf(&self) -> PathBuf {
        self.0.split('/').collect()
    }

    /// The absolute location under `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(self.to_path_buf())
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RepoPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RepoPath::parse(&value)
    }
}

impl From<RepoPath> for String {
    fn from(path: RepoPath) -> Self {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_relative_paths() {
        assert_eq!(RepoPath::parse("src/app.tsx").unwrap().as_str(), "src/app.tsx");
        assert_eq!(RepoPath::parse("./src//app.tsx").unwrap().as_str(), "src/app.tsx");
        assert_eq!(RepoPath::parse("src/../index.html").unwrap().as_str(), "index.html");
        assert_eq!(RepoPath::parse("src\\pages\\home.jsx").unwrap().as_str(), "src/pages/home.jsx");
        assert_eq!(RepoPath::parse("`README.md`").unwrap().as_str(), "README.md");
    }

    #[test]
    fn rejects_escapes() {
        for raw in ["..", "../x", "a/../../x", "./../etc/passwd", "a/b/../../../c"] {
            assert!(
                matches!(RepoPath::parse(raw), Err(PathError::Escapes(_))),
                "{} should escape",
                raw
            );
        }
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(matches!(RepoPath::parse("/etc/passwd"), Err(PathError::Absolute(_))));
        assert!(matches!(RepoPath::parse("\\windows\\x"), Err(PathError::Absolute(_))));
        assert!(matches!(RepoPath::parse("C:/x"), Err(PathError::Absolute(_))));
    }

    #[test]
    fn rejects_git_metadata_and_empty() {
        assert!(matches!(RepoPath::parse(".git/config"), Err(PathError::GitMetadata(_))));
        assert!(matches!(RepoPath::parse("sub/.GIT/hooks/x"), Err(PathError::GitMetadata(_))));
        assert!(matches!(RepoPath::parse(""), Err(PathError::Empty)));
        assert!(matches!(RepoPath::parse("a/.."), Err(PathError::Empty)));
        assert!(matches!(RepoPath::parse("a\0b"), Err(PathError::InvalidCharacter(_))));
    }

    #[test]
    fn every_accepted_path_stays_under_root() {
        let root = Path::new("/work/checkout");
        let candidates = [
            "a", "a/b", "a/./b", "a/b/..", "x/../y/../z", "deep/er/../../still/inside",
            "..", "../a", "a/../..", "/abs", "a/../../b", "...", "..a/b", "a/..b",
        ];

        for raw in candidates {
            if let Ok(path) = RepoPath::parse(raw) {
                let resolved = path.resolve(root);
                assert!(resolved.starts_with(root), "{} resolved to {:?}", raw, resolved);
                assert!(
                    !path.to_path_buf().components().any(|c| matches!(
                        c,
                        std::path::Component::ParentDir | std::path::Component::RootDir
                    )),
                    "{} kept a parent or root component",
                    raw
                );
            }
        }
    }

    #[test]
    fn deserialization_applies_the_rule() {
        let ok: RepoPath = serde_json::from_str("\"src/main.ts\"").unwrap();
        assert_eq!(ok.as_str(), "src/main.ts");
        assert!(serde_json::from_str::<RepoPath>("\"../escape\"").is_err());
    }
}
