//! Error types for the code agent.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for agent runs.
///
/// Variants are split into three groups: errors a new attempt may recover
/// from, fatal setup errors that abort the run before any attempt is made,
/// and ambient errors from I/O, git and the GitHub API.
#[derive(Error, Debug)]
pub enum Error {
    /// Even the minimal prompt (instructions, title, truncated body) exceeds the budget.
    #[error("prompt does not fit the context budget: needs ~{needed} tokens, budget is {budget}")]
    ContextTooLarge { needed: usize, budget: usize },

    /// The model provider kept failing with transient errors, or rejected the request.
    #[error("model provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider answered, but the response had an unexpected shape.
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    /// No file operation could be extracted from the model output.
    #[error("could not extract a patch from the model output: {0}")]
    UnparsablePatch(String),

    /// A patch precondition was violated when applying it.
    #[error("patch conflicts with the working tree at {path}: {reason}")]
    ApplyConflict { path: PathBuf, reason: String },

    /// A required credential was not provided.
    #[error("missing credential: {0} is not set")]
    CredentialMissing(String),

    /// The target repository could not be reached.
    #[error("repository unreachable: {0}")]
    RepositoryUnreachable(String),

    /// The run controller was asked to perform a transition the state machine forbids.
    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The run was cancelled from outside.
    #[error("run cancelled")]
    Cancelled,

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// GitHub API operation failed.
    #[error("GitHub operation failed: {0}")]
    GitHub(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if a fresh attempt may succeed where this one failed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ContextTooLarge { .. }
                | Error::ProviderUnavailable(_)
                | Error::MalformedResponse(_)
                | Error::UnparsablePatch(_)
                | Error::ApplyConflict { .. }
        )
    }

    /// Returns true if the run must be aborted without any attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CredentialMissing(_) | Error::RepositoryUnreachable(_)
        )
    }

    /// Short machine-friendly name used in audit records and status comments.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ContextTooLarge { .. } => "context_too_large",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::MalformedResponse(_) => "malformed_response",
            Error::UnparsablePatch(_) => "unparsable_patch",
            Error::ApplyConflict { .. } => "apply_conflict",
            Error::CredentialMissing(_) => "credential_missing",
            Error::RepositoryUnreachable(_) => "repository_unreachable",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Cancelled => "cancelled",
            Error::Git(_) => "git",
            Error::GitHub(_) => "github",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_are_not_fatal() {
        let errors = [
            Error::ContextTooLarge {
                needed: 10,
                budget: 5,
            },
            Error::ProviderUnavailable("503".to_string()),
            Error::MalformedResponse("empty".to_string()),
            Error::UnparsablePatch("nothing".to_string()),
            Error::ApplyConflict {
                path: PathBuf::from("a.txt"),
                reason: "changed".to_string(),
            },
        ];

        for error in errors {
            assert!(error.is_recoverable(), "{} should be recoverable", error);
            assert!(!error.is_fatal(), "{} should not be fatal", error);
        }
    }

    #[test]
    fn setup_errors_are_fatal() {
        let missing = Error::CredentialMissing("GITHUB_TOKEN".to_string());
        let unreachable = Error::RepositoryUnreachable("owner/repo".to_string());

        assert!(missing.is_fatal());
        assert!(unreachable.is_fatal());
        assert!(!missing.is_recoverable());
        assert!(!unreachable.is_recoverable());
    }

    #[test]
    fn ambient_errors_are_neither() {
        let git = Error::Git("boom".to_string());
        assert!(!git.is_recoverable());
        assert!(!git.is_fatal());
        assert_eq!(git.kind(), "git");
    }

    #[test]
    fn context_error_message_mentions_budget() {
        let error = Error::ContextTooLarge {
            needed: 120,
            budget: 100,
        };
        assert!(error.to_string().contains("120"));
        assert!(error.to_string().contains("100"));
    }
}
