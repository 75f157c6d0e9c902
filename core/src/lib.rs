//! code-agent: resolves GitHub Issues with a language model.
//!
//! The agent reads an Issue, builds a bounded prompt, asks a model for a
//! patch, applies it to a branch, opens a pull request and keeps iterating
//! on CI and reviewer feedback until CI passes or the attempt budget is
//! spent.

pub mod audit;
pub mod backoff;
pub mod ci;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod github;
pub mod model;
pub mod orchestrator;
pub mod patch;
pub mod prompt;
pub mod repo;
pub mod secrets;
pub mod task;

pub use error::{Error, Result};

pub use ci::{CiWatcher, WatchTarget};
pub use config::{AgentConfig, RepoRef, TuningConfig, Validate, ValidationResult};
pub use controller::{AbandonReason, RunController, RunReport, RunState, RunStatus};
pub use events::{CiSignal, ReviewSignal, RunEvent, Signal};
pub use github::{CodeHost, GitHubClient, MemoryHost, PullRequestRef};
pub use model::{ModelClient, ModelProvider, ModelRequest, ModelResponse, ScriptedProvider};
pub use orchestrator::PrOrchestrator;
pub use patch::{FileOperation, PatchSet, PatchSynthesizer, RepoPath};
pub use prompt::{Prompt, PromptBuilder};
pub use repo::{CommitRef, RepoMutator};
pub use task::{Attempt, Task, TaskRef};
