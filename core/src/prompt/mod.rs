//! Prompt construction.
//!
//! [`PromptBuilder`] renders a [`Task`], optional feedback from the previous
//! attempt and repository context into a prompt that fits a token budget.
//! Sections are cut in reverse priority: repository files first (lowest
//! ranked dropped first), then feedback, then the Issue body down to
//! [`MIN_BODY_CHARS`].

pub mod context;

pub use context::{select_context, ContextFile};

use crate::config::PromptSettings;
use crate::error::{Error, Result};
use crate::patch::RepoPath;
use crate::task::Task;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// The Issue body is never cut below this many characters.
pub const MIN_BODY_CHARS: usize = 400;

/// Feedback shorter than this after cutting is dropped instead.
const MIN_FEEDBACK_CHARS: usize = 80;

/// A file is only included partially if at least this much of it fits.
const MIN_FILE_CHARS: usize = 200;

const TRUNCATION_MARKER: &str = "\n[... truncated ...]\n";

/// System message sent with every request.
pub const SYSTEM_INSTRUCTION: &str =
    "You are a senior software engineer. You write minimal, correct code changes as file operations.";

/// Fixed instructions at the top of every prompt.
pub const INSTRUCTIONS: &str = "\
Produce a minimal, correct change that resolves the GitHub Issue below.

Output format. Write one fenced block per file:
- ```create <path>``` with the full content of a new file.
- ```modify <path>``` with either the full new content, or one or more edits:
  <<<<<<< SEARCH
  exact lines from the current file
  =======
  replacement lines
  >>>>>>> REPLACE
- ```delete <path>``` with an empty body.
A unified git diff in a ```diff block is also accepted.

Rules:
- Paths are relative to the repository root.
- SEARCH text must match the current file exactly and only once.
- Do not touch node_modules, dist, build or .git.
- Keep the existing style; avoid large reformatting.
- If the repository already satisfies the Issue, answer with NO_CHANGES_NEEDED on its own line.";

/// Estimated token count: characters divided by four, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Keeps the start of `text` within `limit` characters.
fn keep_head(text: &str, limit: usize) -> (String, bool) {
    if char_len(text) <= limit {
        return (text.to_string(), false);
    }
    let marker = char_len(TRUNCATION_MARKER);
    if limit <= marker {
        return (text.chars().take(limit).collect(), true);
    }
    let mut out: String = text.chars().take(limit - marker).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Keeps the end of `text` within `limit` characters.
fn keep_tail(text: &str, limit: usize) -> (String, bool) {
    let len = char_len(text);
    if len <= limit {
        return (text.to_string(), false);
    }
    let marker = char_len(TRUNCATION_MARKER);
    if limit <= marker {
        return (text.chars().skip(len - limit).collect(), true);
    }
    let keep = limit - marker;
    let mut out = TRUNCATION_MARKER.to_string();
    out.extend(text.chars().skip(len - keep));
    (out, true)
}

/// A rendered prompt and what went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub estimated_tokens: usize,
    pub context_paths: Vec<RepoPath>,
    pub body_truncated: bool,
    pub feedback_included: bool,
    pub feedback_truncated: bool,
}

/// Builds bounded prompts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_prompt_tokens: usize,
}

impl PromptBuilder {
    pub fn new(max_prompt_tokens: usize) -> Self {
        Self { max_prompt_tokens }
    }

    pub fn from_settings(settings: &PromptSettings) -> Self {
        Self::new(settings.max_prompt_tokens)
    }

    pub fn max_prompt_tokens(&self) -> usize {
        self.max_prompt_tokens
    }

    /// Renders the prompt for `task`.
    ///
    /// Fails with [`Error::ContextTooLarge`] when the instructions, the title
    /// and the minimally cut body alone exceed the budget.
    pub fn build(
        &self,
        task: &Task,
        feedback: Option<&str>,
        context: &[ContextFile],
    ) -> Result<Prompt> {
        let budget = self.max_prompt_tokens.saturating_mul(CHARS_PER_TOKEN);

        let head = format!(
            "{}\n\n## Issue #{}\nTitle: {}\n\nBody:\n",
            INSTRUCTIONS,
            task.issue_id(),
            task.title().trim()
        );
        let body = match task.body().trim() {
            "" => "(no description)",
            body => body,
        };

        // head + body + "\n"
        let fixed = char_len(&head) + 1;
        let min_body = char_len(body).min(MIN_BODY_CHARS);
        if fixed + min_body > budget {
            return Err(Error::ContextTooLarge {
                needed: (fixed + min_body).div_ceil(CHARS_PER_TOKEN),
                budget: self.max_prompt_tokens,
            });
        }

        let (body_text, body_truncated) = keep_head(body, budget - fixed);
        let mut text = format!("{}{}\n", head, body_text);
        let mut remaining = budget - char_len(&text);

        let mut feedback_included = false;
        let mut feedback_truncated = false;
        if let Some(feedback) = feedback.map(str::trim).filter(|f| !f.is_empty()) {
            let header = "\n## Feedback from the previous attempt\n";
            let overhead = char_len(header) + 1;
            let wanted = char_len(feedback).min(MIN_FEEDBACK_CHARS);
            if remaining >= overhead + wanted {
                let (kept, cut) = keep_tail(feedback, remaining - overhead);
                text.push_str(header);
                text.push_str(&kept);
                text.push('\n');
                feedback_included = true;
                feedback_truncated = cut;
                remaining = budget - char_len(&text);
            } else {
                tracing::warn!(remaining, "no room left for feedback, dropping it");
            }
        }

        let mut context_paths = Vec::new();
        let files_header = "\n## Repository files\n";
        if !context.is_empty() && remaining > char_len(files_header) {
            let mut section = files_header.to_string();
            let mut room = remaining - char_len(files_header);

            for file in context {
                let entry_head = format!("\n--- FILE: {} ---\n", file.path);
                let overhead = char_len(&entry_head) + 1;
                let content_len = char_len(&file.content);

                if overhead + content_len <= room {
                    section.push_str(&entry_head);
                    section.push_str(&file.content);
                    section.push('\n');
                    room -= overhead + content_len;
                    context_paths.push(file.path.clone());
                    continue;
                }

                if room >= overhead + MIN_FILE_CHARS {
                    let (kept, _) = keep_head(&file.content, room - overhead);
                    section.push_str(&entry_head);
                    section.push_str(&kept);
                    section.push('\n');
                    context_paths.push(file.path.clone());
                }
                break;
            }

            if !context_paths.is_empty() {
                text.push_str(&section);
            }
        }

        let dropped = context.len() - context_paths.len();
        let estimated_tokens = estimate_tokens(&text);

        tracing::debug!(
            estimated_tokens,
            budget = self.max_prompt_tokens,
            files = context_paths.len(),
            dropped_files = dropped,
            body_truncated,
            feedback_truncated,
            "built prompt"
        );

        Ok(Prompt {
            text,
            estimated_tokens,
            context_paths,
            body_truncated,
            feedback_included,
            feedback_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoRef;
    use chrono::Utc;

    fn task(title: &str, body: &str) -> Task {
        Task::new(RepoRef::new("acme", "site"), 12, title, body, Utc::now())
    }

    fn file(path: &str, content: &str) -> ContextFile {
        ContextFile {
            path: RepoPath::parse(path).unwrap(),
            content: content.to_string(),
            truncated: false,
            score: 0,
        }
    }

    #[test]
    fn contains_title_body_and_instructions() {
        let prompt = PromptBuilder::new(24_000)
            .build(
                &task("Change homepage heading", "Change heading to X"),
                None,
                &[file("index.html", "<h1>Old</h1>\n")],
            )
            .unwrap();

        assert!(prompt.text.starts_with(INSTRUCTIONS));
        assert!(prompt.text.contains("Title: Change homepage heading"));
        assert!(prompt.text.contains("Change heading to X"));
        assert!(prompt.text.contains("--- FILE: index.html ---\n<h1>Old</h1>"));
        assert_eq!(prompt.context_paths.len(), 1);
        assert!(!prompt.feedback_included);
    }

    #[test]
    fn stays_within_budget_and_is_deterministic() {
        let builder = PromptBuilder::new(600);
        let task = task("Title", &"body text ".repeat(50));
        let files: Vec<ContextFile> = (0..5)
            .map(|i| file(&format!("src/f{}.ts", i), &"x".repeat(400)))
            .collect();

        let first = builder.build(&task, Some("CI failed: lint"), &files).unwrap();
        let second = builder.build(&task, Some("CI failed: lint"), &files).unwrap();

        assert_eq!(first, second);
        assert!(first.estimated_tokens <= 600);
        assert!(first.context_paths.len() < files.len());
        assert_eq!(first.context_paths[0].as_str(), "src/f0.ts");
    }

    #[test]
    fn lowest_ranked_files_are_dropped_first() {
        let builder = PromptBuilder::new(700);
        let files = vec![
            file("first.ts", &"a".repeat(300)),
            file("second.ts", &"b".repeat(300)),
            file("third.ts", &"c".repeat(5000)),
        ];

        let prompt = builder.build(&task("T", "B"), None, &files).unwrap();

        let paths: Vec<&str> = prompt.context_paths.iter().map(|p| p.as_str()).collect();
        assert!(paths.starts_with(&["first.ts"]));
        assert!(!prompt.text.contains(&"c".repeat(5000)));
        assert!(prompt.estimated_tokens <= 700);
    }

    #[test]
    fn feedback_keeps_the_tail() {
        let instructions_tokens = estimate_tokens(INSTRUCTIONS);
        let builder = PromptBuilder::new(instructions_tokens + 150);
        let feedback = format!("{}FINAL ERROR: test_heading failed", "noise ".repeat(200));

        let prompt = builder.build(&task("T", "B"), Some(&feedback), &[]).unwrap();

        assert!(prompt.feedback_included);
        assert!(prompt.feedback_truncated);
        assert!(prompt.text.contains("FINAL ERROR: test_heading failed"));
        assert!(prompt.estimated_tokens <= instructions_tokens + 150);
    }

    #[test]
    fn body_is_cut_but_never_below_minimum() {
        let instructions_tokens = estimate_tokens(INSTRUCTIONS);
        let builder = PromptBuilder::new(instructions_tokens + 150);
        let body = "word ".repeat(1000);

        let prompt = builder.build(&task("T", &body), None, &[]).unwrap();

        assert!(prompt.body_truncated);
        assert!(prompt.text.contains(&"word ".repeat(MIN_BODY_CHARS / 5 - 10)));
        assert!(prompt.estimated_tokens <= instructions_tokens + 150);
    }

    #[test]
    fn too_small_budget_is_context_too_large() {
        let err = PromptBuilder::new(10)
            .build(&task("Change homepage heading", "Change heading to X"), None, &[])
            .unwrap_err();

        assert!(matches!(err, Error::ContextTooLarge { budget: 10, .. }));
    }

    #[test]
    fn empty_body_gets_placeholder() {
        let prompt = PromptBuilder::new(24_000)
            .build(&task("Title only", "  "), None, &[])
            .unwrap();
        assert!(prompt.text.contains("(no description)"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
