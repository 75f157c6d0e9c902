//! Extraction of file operations from model output.
//!
//! Two shapes are understood: fenced per-file blocks (```` ```create path ````,
//! ```` ```modify path ````, ```` ```delete path ````) and unified diffs, either
//! fenced as ```` ```diff ```` or written as bare `diff --git` text. Nothing
//! here touches the filesystem; paths are returned raw and validated by the
//! synthesizer.

use std::sync::OnceLock;

use regex::Regex;

use super::Edit;

/// Sentinel the model prints when the Issue needs no change.
pub const NO_CHANGES_SENTINEL: &str = "NO_CHANGES_NEEDED";

static HUNK_HEADER: OnceLock<Option<Regex>> = OnceLock::new();

fn hunk_header() -> Option<&'static Regex> {
    HUNK_HEADER
        .get_or_init(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").ok())
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawAction {
    Create(String),
    Replace(String),
    Edits(Vec<Edit>),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawOperation {
    pub path: String,
    pub action: RawAction,
}

#[derive(Debug, Default)]
pub(crate) struct ParsedOutput {
    pub operations: Vec<RawOperation>,
    pub no_change: bool,
    /// Blocks that looked like operations but could not be read.
    pub problems: Vec<String>,
}

struct Fence<'a> {
    marker: char,
    width: usize,
    info: &'a str,
}

fn fence_open(line: &str) -> Option<Fence<'_>> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let width = trimmed.chars().take_while(|c| *c == marker).count();
    if width < 3 {
        return None;
    }
    let info = trimmed[width..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some(Fence {
        marker,
        width,
        info,
    })
}

fn closes(line: &str, fence: &Fence<'_>) -> bool {
    let trimmed = line.trim();
    let width = trimmed.chars().take_while(|c| *c == fence.marker).count();
    width >= fence.width && width == trimmed.chars().count()
}

fn is_sentinel(line: &str) -> bool {
    line.trim().trim_matches(|c| c == '*' || c == '`' || c == '_') == NO_CHANGES_SENTINEL
}

/// Reads every operation found in `text`.
pub(crate) fn parse_response(text: &str) -> ParsedOutput {
    let lines: Vec<&str> = text.lines().collect();
    let mut output = ParsedOutput::default();
    let mut outside: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let Some(fence) = fence_open(lines[i]) else {
            outside.push(lines[i]);
            i += 1;
            continue;
        };

        let mut end = i + 1;
        while end < lines.len() && !closes(lines[end], &fence) {
            end += 1;
        }
        let body = &lines[(i + 1).min(lines.len())..end.min(lines.len())];
        read_block(fence.info, body, &mut output);
        i = end + 1;
    }

    if outside.iter().any(|l| is_sentinel(l)) {
        output.no_change = true;
    }
    if let Some(start) = bare_diff_start(&outside) {
        read_unified_diff(&outside[start..], &mut output);
    }

    output
}

fn read_block(info: &str, body: &[&str], output: &mut ParsedOutput) {
    let mut words = info.split_whitespace();
    let keyword = words
        .next()
        .map(|w| w.trim_end_matches(':').to_ascii_lowercase())
        .unwrap_or_default();
    let path = words.next().map(str::to_string);

    match keyword.as_str() {
        "create" | "new" | "modify" | "update" | "edit" | "delete" | "remove" => {
            let Some(path) = path else {
                output
                    .problems
                    .push(format!("`{}` block without a path", keyword));
                return;
            };
            let action = match keyword.as_str() {
                "create" | "new" => RawAction::Create(join_content(body)),
                "delete" | "remove" => RawAction::Delete,
                _ => match read_modify_body(body) {
                    Ok(action) => action,
                    Err(problem) => {
                        output.problems.push(format!("{}: {}", path, problem));
                        return;
                    }
                },
            };
            output.operations.push(RawOperation { path, action });
        }
        "diff" | "patch" | "udiff" => read_unified_diff(body, output),
        _ => {
            // Plain code samples are ignored unless they hold a diff.
            if let Some(start) = bare_diff_start(body) {
                read_unified_diff(&body[start..], output);
            } else if body.iter().any(|l| is_sentinel(l)) {
                output.no_change = true;
            }
        }
    }
}

fn join_content(body: &[&str]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let mut content = body.join("\n");
    content.push('\n');
    content
}

fn join_lines(lines: &[String]) -> String {
    join_content(&lines.iter().map(String::as_str).collect::<Vec<_>>())
}

fn read_modify_body(body: &[&str]) -> Result<RawAction, String> {
    let has_markers = body
        .iter()
        .any(|l| l.trim_start().starts_with("<<<<<<<"));
    if has_markers {
        read_search_replace(body).map(RawAction::Edits)
    } else {
        Ok(RawAction::Replace(join_content(body)))
    }
}

enum EditState {
    Outside,
    Search(Vec<String>),
    Replace(Vec<String>, Vec<String>),
}

fn read_search_replace(body: &[&str]) -> Result<Vec<Edit>, String> {
    let mut edits = Vec::new();
    let mut state = EditState::Outside;

    for line in body {
        let marker = line.trim();
        state = match state {
            EditState::Outside if marker.starts_with("<<<<<<<") => EditState::Search(Vec::new()),
            EditState::Outside => EditState::Outside,
            EditState::Search(search) if marker == "=======" => {
                EditState::Replace(search, Vec::new())
            }
            EditState::Search(mut search) => {
                search.push(line.to_string());
                EditState::Search(search)
            }
            EditState::Replace(search, replace) if marker.starts_with(">>>>>>>") => {
                edits.push(Edit {
                    search: search.join("\n"),
                    replace: replace.join("\n"),
                    line_hint: None,
                });
                EditState::Outside
            }
            EditState::Replace(search, mut replace) => {
                replace.push(line.to_string());
                EditState::Replace(search, replace)
            }
        };
    }

    if !matches!(state, EditState::Outside) {
        return Err("unterminated SEARCH/REPLACE block".to_string());
    }
    if edits.is_empty() {
        return Err("no SEARCH/REPLACE edits found".to_string());
    }
    Ok(edits)
}

fn bare_diff_start(lines: &[&str]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(idx, line)| {
        if line.starts_with("diff --git ") {
            return Some(idx);
        }
        let next = lines.get(idx + 1)?;
        (line.starts_with("--- ") && next.starts_with("+++ ")).then_some(idx)
    })
}

const DEV_NULL: &str = "/dev/null";

#[derive(Default)]
struct DiffFile {
    git_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    new_file: bool,
    deleted_file: bool,
    hunks: Vec<Hunk>,
}

struct Hunk {
    old_start: usize,
    old_count: usize,
    new_count: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
    /// Set at the first line after the counted body that is not a diff line.
    closed: bool,
}

impl Hunk {
    fn is_complete(&self) -> bool {
        self.old_lines.len() >= self.old_count && self.new_lines.len() >= self.new_count
    }

    /// Whether the body has exactly the line counts the `@@` header claims.
    fn matches_header(&self) -> bool {
        self.old_lines.len() == self.old_count && self.new_lines.len() == self.new_count
    }
}

fn is_diff_line(line: &str) -> bool {
    matches!(line.chars().next(), Some('+' | '-' | ' ' | '\\'))
}

fn diff_path(raw: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == DEV_NULL {
        return path.to_string();
    }
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

fn read_unified_diff(lines: &[&str], output: &mut ParsedOutput) {
    let mut current: Option<DiffFile> = None;

    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];
        let next = lines.get(idx + 1).copied().unwrap_or_default();
        idx += 1;

        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish_file(current.take(), output);
            let git_path = rest.split_whitespace().last().map(diff_path);
            current = Some(DiffFile {
                git_path,
                ..DiffFile::default()
            });
            continue;
        }

        let in_open_hunk = current
            .as_ref()
            .and_then(|f| f.hunks.last())
            .is_some_and(|h| !h.is_complete());

        if line.starts_with("--- ") && next.starts_with("+++ ") && !in_open_hunk {
            let file = match current.take() {
                Some(file) if file.hunks.is_empty() && file.old_path.is_none() => file,
                other => {
                    finish_file(other, output);
                    DiffFile::default()
                }
            };
            current = Some(DiffFile {
                old_path: Some(diff_path(&line[4..])),
                new_path: Some(diff_path(&next[4..])),
                ..file
            });
            idx += 1;
            continue;
        }

        let Some(file) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = hunk_header().and_then(|re| re.captures(line)) {
            let number = |i: usize, default: usize| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .unwrap_or(default)
            };
            file.hunks.push(Hunk {
                old_start: number(1, 0),
                old_count: number(2, 1),
                new_count: number(4, 1),
                old_lines: Vec::new(),
                new_lines: Vec::new(),
                closed: false,
            });
            continue;
        }

        if line.starts_with("new file mode") {
            file.new_file = true;
            continue;
        }
        if line.starts_with("deleted file mode") {
            file.deleted_file = true;
            continue;
        }

        let Some(hunk) = file.hunks.last_mut() else {
            continue;
        };
        if hunk.closed {
            continue;
        }
        // Header counts are often wrong in model output, so the body is read
        // past them for as long as it still looks like a diff.
        if hunk.is_complete() && !is_diff_line(line) {
            hunk.closed = true;
            continue;
        }

        if let Some(rest) = line.strip_prefix('+') {
            hunk.new_lines.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.old_lines.push(rest.to_string());
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            let context = line.strip_prefix(' ').unwrap_or(line).to_string();
            hunk.old_lines.push(context.clone());
            hunk.new_lines.push(context);
        }
    }

    finish_file(current, output);
}

fn finish_file(file: Option<DiffFile>, output: &mut ParsedOutput) {
    let Some(file) = file else {
        return;
    };

    let old = file.old_path.clone().or_else(|| file.git_path.clone());
    let new = file.new_path.clone().or_else(|| file.git_path.clone());
    let creates = file.new_file || old.as_deref() == Some(DEV_NULL);
    let deletes = file.deleted_file || new.as_deref() == Some(DEV_NULL);

    let target = if deletes { old } else { new };
    let Some(path) = target.filter(|p| p != DEV_NULL) else {
        output.problems.push("diff section without a file path".to_string());
        return;
    };

    if !creates && !deletes {
        if let Some(old) = file.old_path.as_deref().filter(|o| *o != path) {
            output
                .problems
                .push(format!("rename from {} to {} is not supported", old, path));
            return;
        }
    }

    let action = if deletes {
        RawAction::Delete
    } else if creates {
        let added: Vec<&str> = file
            .hunks
            .iter()
            .flat_map(|h| h.new_lines.iter().map(String::as_str))
            .collect();
        RawAction::Create(join_content(&added))
    } else {
        if file.hunks.is_empty() {
            output.problems.push(format!("{}: diff has no hunks", path));
            return;
        }
        // Hints are shifted by earlier hunks because edits apply in sequence.
        let mut shift: isize = 0;
        let edits = file
            .hunks
            .iter()
            .map(|hunk| {
                if !hunk.matches_header() {
                    tracing::debug!(
                        path = %path,
                        header_old = hunk.old_count,
                        header_new = hunk.new_count,
                        body_old = hunk.old_lines.len(),
                        body_new = hunk.new_lines.len(),
                        "hunk header miscounts its body, using the body"
                    );
                }
                let hint = (hunk.old_start as isize + shift).max(0) as usize;
                shift += hunk.new_lines.len() as isize - hunk.old_lines.len() as isize;
                Edit {
                    search: join_lines(&hunk.old_lines),
                    replace: join_lines(&hunk.new_lines),
                    line_hint: Some(hint),
                }
            })
            .collect();
        RawAction::Edits(edits)
    };

    output.operations.push(RawOperation { path, action });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fenced_create_modify_delete() {
        let text = "Here you go.\n\n```create src/new.ts\nexport const x = 1;\n```\n\n```modify index.html\n<h1>X</h1>\n```\n\n```delete old.txt\n```\n";

        let parsed = parse_response(text);

        assert_eq!(
            parsed.operations,
            vec![
                RawOperation {
                    path: "src/new.ts".to_string(),
                    action: RawAction::Create("export const x = 1;\n".to_string()),
                },
                RawOperation {
                    path: "index.html".to_string(),
                    action: RawAction::Replace("<h1>X</h1>\n".to_string()),
                },
                RawOperation {
                    path: "old.txt".to_string(),
                    action: RawAction::Delete,
                },
            ]
        );
        assert!(!parsed.no_change);
    }

    #[test]
    fn reads_search_replace_edits() {
        let text = "```modify src/App.tsx\n<<<<<<< SEARCH\n<h1>Old</h1>\n=======\n<h1>X</h1>\n>>>>>>> REPLACE\n<<<<<<< SEARCH\nfoo()\n=======\nbar()\n>>>>>>> REPLACE\n```";

        let parsed = parse_response(text);

        let RawAction::Edits(edits) = &parsed.operations[0].action else {
            panic!("expected edits");
        };
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].search, "<h1>Old</h1>");
        assert_eq!(edits[0].replace, "<h1>X</h1>");
        assert_eq!(edits[1].replace, "bar()");
    }

    #[test]
    fn unterminated_edit_is_a_problem() {
        let parsed = parse_response("```modify a.txt\n<<<<<<< SEARCH\nx\n=======\ny\n```");
        assert!(parsed.operations.is_empty());
        assert!(parsed.problems[0].contains("unterminated"));
    }

    #[test]
    fn longer_fence_may_contain_shorter_ones() {
        let text = "````create README.md\n# Title\n```sh\nnpm test\n```\n````";
        let parsed = parse_response(text);
        assert_eq!(
            parsed.operations[0].action,
            RawAction::Create("# Title\n```sh\nnpm test\n```\n".to_string())
        );
    }

    #[test]
    fn detects_sentinel() {
        let parsed = parse_response("The heading already says X.\n\nNO_CHANGES_NEEDED\n");
        assert!(parsed.no_change);
        assert!(parsed.operations.is_empty());

        assert!(parse_response("**NO_CHANGES_NEEDED**").no_change);
        assert!(!parse_response("we said NO_CHANGES_NEEDED earlier").no_change);
    }

    #[test]
    fn ignores_plain_code_samples() {
        let parsed = parse_response("```js\nconsole.log(1)\n```");
        assert!(parsed.operations.is_empty());
        assert!(parsed.problems.is_empty());
    }

    #[test]
    fn reads_fenced_unified_diff() {
        let text = "```diff\ndiff --git a/index.html b/index.html\nindex 1111..2222 100644\n--- a/index.html\n+++ b/index.html\n@@ -1,3 +1,3 @@\n <body>\n-<h1>Old</h1>\n+<h1>X</h1>\n </body>\n```";

        let parsed = parse_response(text);

        assert_eq!(parsed.operations.len(), 1);
        assert_eq!(parsed.operations[0].path, "index.html");
        let RawAction::Edits(edits) = &parsed.operations[0].action else {
            panic!("expected edits");
        };
        assert_eq!(edits[0].search, "<body>\n<h1>Old</h1>\n</body>\n");
        assert_eq!(edits[0].replace, "<body>\n<h1>X</h1>\n</body>\n");
        assert_eq!(edits[0].line_hint, Some(1));
    }

    #[test]
    fn reads_bare_diff_with_create_and_delete() {
        let text = "diff --git a/new.txt b/new.txt\nnew file mode 100644\n--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+one\n+two\ndiff --git a/gone.txt b/gone.txt\ndeleted file mode 100644\n--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";

        let parsed = parse_response(text);

        assert_eq!(
            parsed.operations,
            vec![
                RawOperation {
                    path: "new.txt".to_string(),
                    action: RawAction::Create("one\ntwo\n".to_string()),
                },
                RawOperation {
                    path: "gone.txt".to_string(),
                    action: RawAction::Delete,
                },
            ]
        );
    }

    #[test]
    fn shifts_hints_across_hunks() {
        let text = "--- a/f.txt\n+++ b/f.txt\n@@ -1,1 +1,2 @@\n a\n+b\n@@ -5,1 +6,1 @@\n-e\n+E\n";

        let parsed = parse_response(text);

        let RawAction::Edits(edits) = &parsed.operations[0].action else {
            panic!("expected edits");
        };
        assert_eq!(edits[0].line_hint, Some(1));
        assert_eq!(edits[1].line_hint, Some(6));
    }

    #[test]
    fn undercounted_hunk_keeps_every_added_line() {
        let text = "--- a/index.html\n+++ b/index.html\n@@ -1,2 +1,2 @@\n <main>\n-<h1>Old</h1>\n+<h1>X</h1>\n+<p>Subtitle</p>\n </main>\n";

        let parsed = parse_response(text);

        let RawAction::Edits(edits) = &parsed.operations[0].action else {
            panic!("expected edits");
        };
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].search, "<main>\n<h1>Old</h1>\n</main>\n");
        assert_eq!(edits[0].replace, "<main>\n<h1>X</h1>\n<p>Subtitle</p>\n</main>\n");
    }

    #[test]
    fn prose_after_a_bare_diff_is_not_hunk_body() {
        let text = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-a\n+b\nThat should fix it.\n";

        let parsed = parse_response(text);

        let RawAction::Edits(edits) = &parsed.operations[0].action else {
            panic!("expected edits");
        };
        assert_eq!(edits[0].search, "a\n");
        assert_eq!(edits[0].replace, "b\n");
    }

    #[test]
    fn rename_is_reported() {
        let parsed = parse_response("--- a/old.txt\n+++ b/new.txt\n@@ -1 +1 @@\n-a\n+b\n");
        assert!(parsed.operations.is_empty());
        assert!(parsed.problems[0].contains("rename"));
    }
}
