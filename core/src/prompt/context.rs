//! Repository file context for prompts.
//!
//! Walks the checkout, keeps small text files with known extensions and
//! ranks them against the Issue text so the most relevant files are sent
//! to the model first.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use walkdir::{DirEntry, WalkDir};

use crate::patch::RepoPath;

/// Directories never scanned.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".next",
    ".turbo",
    ".cache",
    "__pycache__",
    "coverage",
    ".idea",
    ".vscode",
    "target",
];

/// Extensions of files that may be sent as context.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "css", "scss", "html", "json", "md", "yml", "yaml",
];

/// Files larger than this are skipped.
pub const MAX_FILE_BYTES: u64 = 300_000;

/// Appended to a file cut at `max_chars_per_file`.
pub const FILE_TRUNCATION_MARKER: &str = "\n\n/* ...truncated... */\n";

const MAX_KEYWORDS: usize = 80;
const KEYWORD_SCORE: u32 = 5;
const ENTRYPOINT_SCORE: u32 = 10;

/// Path fragments of typical frontend entrypoints.
const ENTRYPOINT_HINTS: &[&str] = &[
    "src/app",
    "src/main",
    "src/index",
    "src/pages",
    "src/components",
    "app.tsx",
    "app.jsx",
    "main.tsx",
    "main.jsx",
    "index.tsx",
    "index.jsx",
    "package.json",
    "vite.config",
    "next.config",
];

static KEYWORD: OnceLock<Option<Regex>> = OnceLock::new();

/// A repository file selected for the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: RepoPath,
    pub content: String,
    pub truncated: bool,
    pub score: u32,
}

/// Keywords of at least three characters from the Issue text, lowercased.
pub fn keywords(issue_text: &str) -> Vec<String> {
    let Some(re) = KEYWORD
        .get_or_init(|| Regex::new(r"[a-z0-9_/-]{3,}").ok())
        .as_ref()
    else {
        return Vec::new();
    };

    let lower = issue_text.to_lowercase();
    re.find_iter(&lower)
        .take(MAX_KEYWORDS)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Relevance of a path for the given keywords.
pub fn score_path(path: &str, keywords: &[String]) -> u32 {
    let name = path.to_lowercase();
    let keyword_hits = keywords.iter().filter(|k| name.contains(k.as_str())).count() as u32;
    let entrypoint_hits = ENTRYPOINT_HINTS
        .iter()
        .filter(|hint| name.contains(*hint))
        .count() as u32;
    keyword_hits * KEYWORD_SCORE + entrypoint_hits * ENTRYPOINT_SCORE
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
}

/// Lists candidate files under `root`, sorted by path.
pub fn gather_files(root: &Path) -> Vec<RepoPath> {
    let mut files: Vec<RepoPath> = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_allowed_extension(e.path()))
        .filter(|e| {
            e.metadata()
                .map(|m| m.len() <= MAX_FILE_BYTES)
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let relative = e.path().strip_prefix(root).ok()?;
            RepoPath::parse(&relative.to_string_lossy()).ok()
        })
        .collect();
    files.sort();
    files
}

fn cap_chars(content: String, max_chars: usize) -> (String, bool) {
    if content.chars().count() <= max_chars {
        return (content, false);
    }
    let mut capped: String = content.chars().take(max_chars).collect();
    capped.push_str(FILE_TRUNCATION_MARKER);
    (capped, true)
}

/// Selects the `max_files` most relevant files, each capped at `max_chars` characters.
///
/// Ties are broken by path, so the selection is stable for a given tree.
pub fn select_context(
    root: &Path,
    issue_text: &str,
    max_files: usize,
    max_chars: usize,
) -> Vec<ContextFile> {
    let keywords = keywords(issue_text);

    let mut ranked: Vec<(u32, RepoPath)> = gather_files(root)
        .into_iter()
        .map(|path| (score_path(path.as_str(), &keywords), path))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let selected: Vec<ContextFile> = ranked
        .into_iter()
        .take(max_files)
        .filter_map(|(score, path)| {
            let bytes = match std::fs::read(path.resolve(root)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "skipping unreadable context file");
                    return None;
                }
            };
            let (content, truncated) =
                cap_chars(String::from_utf8_lossy(&bytes).into_owned(), max_chars);
            Some(ContextFile {
                path,
                content,
                truncated,
                score,
            })
        })
        .collect();

    tracing::debug!(
        files = selected.len(),
        paths = ?selected.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        "selected repository context"
    );

    selected
}
