//! Patch synthesis.
//!
//! [`PatchSynthesizer`] turns a model answer into a [`PatchSet`]: an ordered
//! list of validated [`FileOperation`]s, each targeting a [`RepoPath`] and
//! carrying the digest of the content it was computed against.

mod parse;
pub mod path;

pub use parse::NO_CHANGES_SENTINEL;
pub use path::{PathError, RepoPath};

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::ModelResponse;

use parse::RawAction;

/// Read access to the current known content of the checkout.
pub trait FileSource {
    /// Returns the file's text, or `None` when it does not exist.
    fn read(&self, path: &RepoPath) -> Option<String>;
}

impl FileSource for BTreeMap<String, String> {
    fn read(&self, path: &RepoPath) -> Option<String> {
        self.get(path.as_str()).cloned()
    }
}

/// SHA-256 of `content`, hex encoded.
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// One search/replace edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub search: String,
    pub replace: String,
    /// 1-based line the edit was written against. Set only for unified
    /// diff hunks, whose edits replace whole lines anchored at line starts.
    /// Disambiguates repeated search text; for an empty search it is the
    /// line after which `replace` is inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_hint: Option<usize>,
}

/// How a modify operation changes the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModifyChange {
    Replace { content: String },
    Edits { edits: Vec<Edit> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationKind {
    Create { content: String },
    Modify { change: ModifyChange },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationStatus {
    Ready,
    Conflicting { reason: String },
}

/// A single file change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub path: RepoPath,
    pub kind: OperationKind,
    /// Digest of the content a modify or delete was computed against.
    pub base_digest: Option<String>,
    pub status: OperationStatus,
}

impl FileOperation {
    /// Short name of the operation kind.
    pub fn action(&self) -> &'static str {
        match self.kind {
            OperationKind::Create { .. } => "create",
            OperationKind::Modify { .. } => "modify",
            OperationKind::Delete => "delete",
        }
    }

    pub fn conflict_reason(&self) -> Option<&str> {
        match &self.status {
            OperationStatus::Conflicting { reason } => Some(reason),
            OperationStatus::Ready => None,
        }
    }

    pub fn is_conflicting(&self) -> bool {
        self.conflict_reason().is_some()
    }

    /// Computes the file's new content from its current content.
    /// `Ok(None)` means the file is removed.
    pub fn render(&self, current: Option<&str>) -> std::result::Result<Option<String>, String> {
        match &self.kind {
            OperationKind::Create { content }
            | OperationKind::Modify {
                change: ModifyChange::Replace { content },
            } => Ok(Some(content.clone())),
            OperationKind::Modify {
                change: ModifyChange::Edits { edits },
            } => {
                let current = current.ok_or_else(|| "file does not exist".to_string())?;
                apply_edits(current, edits).map(Some)
            }
            OperationKind::Delete => Ok(None),
        }
    }
}

/// A path the model named that failed the containment check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPath {
    pub raw: String,
    pub reason: String,
}

/// The atomic unit of repository mutation for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    operations: Vec<FileOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rejected: Vec<RejectedPath>,
}

impl PatchSet {
    /// The "no change needed" patch.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_operations(operations: Vec<FileOperation>) -> Self {
        Self {
            operations,
            rejected: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[FileOperation] {
        &self.operations
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileOperation> {
        self.operations.iter()
    }

    pub fn paths(&self) -> Vec<&RepoPath> {
        self.operations.iter().map(|op| &op.path).collect()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &FileOperation> {
        self.operations.iter().filter(|op| op.is_conflicting())
    }

    /// Paths dropped because they failed the containment check.
    pub fn rejected(&self) -> &[RejectedPath] {
        &self.rejected
    }
}

/// Applies edits in order. Each edit's search text must match exactly once,
/// unless a line hint picks between several matches.
pub fn apply_edits(content: &str, edits: &[Edit]) -> std::result::Result<String, String> {
    let mut current = content.to_string();
    for (idx, edit) in edits.iter().enumerate() {
        current = apply_edit(&current, edit).map_err(|reason| format!("edit {}: {}", idx + 1, reason))?;
    }
    Ok(current)
}

fn apply_edit(content: &str, edit: &Edit) -> std::result::Result<String, String> {
    if let Some(hint) = edit.line_hint {
        return apply_line_edit(content, edit, hint);
    }
    if edit.search.is_empty() {
        return Err("empty search text".to_string());
    }

    let matches: Vec<usize> = content
        .match_indices(edit.search.as_str())
        .map(|(offset, _)| offset)
        .collect();
    let chosen = match matches.as_slice() {
        [] => return Err("search text not found".to_string()),
        [only] => *only,
        many => return Err(format!("search text matches {} times", many.len())),
    };

    let mut out = String::with_capacity(content.len() + edit.replace.len());
    out.push_str(&content[..chosen]);
    out.push_str(&edit.replace);
    out.push_str(&content[chosen + edit.search.len()..]);
    Ok(out)
}

/// Applies a diff hunk. Matches must start at a line start; whole-line
/// search text also ends at a line end, so a hunk never edits part of a line.
fn apply_line_edit(content: &str, edit: &Edit, hint: usize) -> std::result::Result<String, String> {
    // Without a final newline the last line could never match a whole-line search.
    let padded = !content.is_empty() && !content.ends_with('\n');
    let mut text = content.to_string();
    if padded {
        text.push('\n');
    }

    let (start, end) = if edit.search.is_empty() {
        let offset = offset_after_line(&text, hint);
        (offset, offset)
    } else {
        let matches: Vec<usize> = text
            .match_indices(edit.search.as_str())
            .map(|(offset, _)| offset)
            .filter(|offset| *offset == 0 || text.as_bytes()[offset - 1] == b'\n')
            .collect();
        let chosen = match matches.as_slice() {
            [] => return Err("search text not found".to_string()),
            [only] => *only,
            many => many
                .iter()
                .copied()
                .min_by_key(|offset| line_of(&text, *offset).abs_diff(hint))
                .unwrap_or(many[0]),
        };
        (chosen, chosen + edit.search.len())
    };

    let whole_lines = edit.search.is_empty() || edit.search.ends_with('\n');
    let mut out = String::with_capacity(text.len() + edit.replace.len() + 1);
    out.push_str(&text[..start]);
    out.push_str(&edit.replace);
    if whole_lines && !edit.replace.is_empty() && !edit.replace.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&text[end..]);
    if padded && out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn offset_after_line(content: &str, line: usize) -> usize {
    if line == 0 {
        return 0;
    }
    content
        .match_indices('\n')
        .nth(line - 1)
        .map(|(idx, _)| idx + 1)
        .unwrap_or(content.len())
}

/// Accumulated effect of every operation the model wrote for one path.
struct PathState {
    original: Option<String>,
    current: Option<String>,
    /// Edits so far, while every change to this path was an edit.
    edits: Option<Vec<Edit>>,
    conflict: Option<(String, OperationKind)>,
}

impl PathState {
    fn new(original: Option<String>) -> Self {
        Self {
            current: original.clone(),
            original,
            edits: Some(Vec::new()),
            conflict: None,
        }
    }

    fn apply(&mut self, action: RawAction) {
        if self.conflict.is_some() {
            return;
        }

        match action {
            RawAction::Create(content) | RawAction::Replace(content) => {
                self.current = Some(content);
                self.edits = None;
            }
            RawAction::Edits(edits) => {
                let Some(current) = self.current.as_deref() else {
                    self.conflict = Some((
                        "file does not exist".to_string(),
                        OperationKind::Modify {
                            change: ModifyChange::Edits { edits },
                        },
                    ));
                    return;
                };
                match apply_edits(current, &edits) {
                    Ok(updated) => {
                        self.current = Some(updated);
                        if let Some(all) = self.edits.as_mut() {
                            all.extend(edits);
                        }
                    }
                    Err(reason) => {
                        self.conflict = Some((
                            reason,
                            OperationKind::Modify {
                                change: ModifyChange::Edits { edits },
                            },
                        ));
                    }
                }
            }
            RawAction::Delete => {
                if self.current.is_none() {
                    self.conflict = Some(("file does not exist".to_string(), OperationKind::Delete));
                    return;
                }
                self.current = None;
                self.edits = None;
            }
        }
    }

    fn into_operation(self, path: RepoPath) -> Option<FileOperation> {
        let base_digest = self.original.as_deref().map(content_digest);

        if let Some((reason, kind)) = self.conflict {
            return Some(FileOperation {
                path,
                kind,
                base_digest,
                status: OperationStatus::Conflicting { reason },
            });
        }

        let kind = match (self.original.as_deref(), self.current) {
            (None, Some(content)) => OperationKind::Create { content },
            (Some(original), Some(content)) if original == content => return None,
            (Some(_), Some(content)) => {
                let change = match self.edits {
                    Some(edits) if !edits.is_empty() => ModifyChange::Edits { edits },
                    _ => ModifyChange::Replace { content },
                };
                OperationKind::Modify { change }
            }
            (Some(_), None) => OperationKind::Delete,
            (None, None) => return None,
        };

        let base_digest = match kind {
            OperationKind::Create { .. } => None,
            _ => base_digest,
        };

        Some(FileOperation {
            path,
            kind,
            base_digest,
            status: OperationStatus::Ready,
        })
    }
}

/// Converts model output into a validated patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchSynthesizer;

impl PatchSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Parses `response` and validates every operation against `source`.
    ///
    /// Returns an empty patch for the no-change sentinel and
    /// [`Error::UnparsablePatch`] when no valid operation can be extracted.
    pub fn synthesize(&self, response: &ModelResponse, source: &dyn FileSource) -> Result<PatchSet> {
        let parsed = parse::parse_response(&response.raw_text);

        for problem in &parsed.problems {
            tracing::warn!(problem = %problem, "skipping unreadable patch block");
        }

        if parsed.operations.is_empty() {
            if parsed.no_change {
                tracing::info!(model = %response.model_id, "model reported no change needed");
                return Ok(PatchSet::empty());
            }
            let detail = if parsed.problems.is_empty() {
                "no file operations found in model output".to_string()
            } else {
                parsed.problems.join("; ")
            };
            return Err(Error::UnparsablePatch(detail));
        }

        let mut order: Vec<RepoPath> = Vec::new();
        let mut states: HashMap<RepoPath, PathState> = HashMap::new();
        let mut rejected = Vec::new();

        for raw in parsed.operations {
            let path = match RepoPath::parse(&raw.path) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(path = %raw.path, error = %e, "rejecting operation outside the repository");
                    rejected.push(RejectedPath {
                        raw: raw.path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let state = states.entry(path.clone()).or_insert_with(|| {
                order.push(path.clone());
                PathState::new(source.read(&path))
            });
            state.apply(raw.action);
        }

        if order.is_empty() {
            let reasons: Vec<String> = rejected.iter().map(|r| r.reason.clone()).collect();
            return Err(Error::UnparsablePatch(format!(
                "no valid operation: {}",
                reasons.join("; ")
            )));
        }

        let operations: Vec<FileOperation> = order
            .into_iter()
            .filter_map(|path| {
                let state = states.remove(&path)?;
                state.into_operation(path)
            })
            .collect();

        for op in &operations {
            match op.conflict_reason() {
                Some(reason) => {
                    tracing::warn!(path = %op.path, action = op.action(), reason = %reason, "conflicting operation")
                }
                None => tracing::debug!(path = %op.path, action = op.action(), "operation ready"),
            }
        }

        Ok(PatchSet {
            operations,
            rejected,
        })
    }
}
