//! Agent configuration.
//!
//! Everything process-wide (credentials, model id, target repository, retry
//! caps) is collected once into an [`AgentConfig`] and handed to the run
//! controller. Components never read the environment themselves.
//!
//! Tunables live in an optional TOML file (`.code-agent.toml` by default,
//! or the path in `CODE_AGENT_CONFIG`); every field has a default.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secrets::Secret;

/// Model used when `MODEL` is unset.
pub const DEFAULT_MODEL: &str = "qwen/qwen3-coder:free";

/// Default name of the tuning file, relative to the working directory.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

pub const DEFAULT_TUNING_FILE: &str = ".code-agent.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// `owner/name` reference to a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(Error::Config(format!(
                "GITHUB_REPOSITORY must look like owner/name, got '{}'",
                trimmed
            ))),
        }
    }
}

/// Which model backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenRouter (OpenAI-compatible chat completions).
    #[default]
    OpenRouter,
    /// Pre-recorded responses read from `scripted_responses`.
    Scripted,
}

/// Settings for the model client adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Models tried, in order, after the primary model is exhausted.
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Provider calls per model before giving up on it.
    #[serde(default = "default_max_provider_retries")]
    pub max_provider_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Responses replayed by the scripted provider, in order.
    #[serde(default)]
    pub scripted_responses: Vec<String>,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_fallback_models() -> Vec<String> {
    vec![
        "qwen/qwen3-coder:free".to_string(),
        "openai/gpt-oss-120b:free".to_string(),
        "tngtech/deepseek-r1t2-chimera:free".to_string(),
    ]
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_provider_retries() -> u32 {
    4
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            fallback_models: default_fallback_models(),
            request_timeout_secs: default_request_timeout(),
            max_provider_retries: default_max_provider_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            scripted_responses: Vec::new(),
        }
    }
}

impl ModelSettings {
    /// Returns the per-call timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the initial retry delay as a Duration.
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Returns the maximum retry delay as a Duration.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Settings for the prompt builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_context_files")]
    pub max_context_files: usize,
    #[serde(default = "default_max_chars_per_file")]
    pub max_chars_per_file: usize,
}

fn default_max_prompt_tokens() -> usize {
    24_000
}

fn default_max_context_files() -> usize {
    8
}

fn default_max_chars_per_file() -> usize {
    7_000
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            max_prompt_tokens: default_max_prompt_tokens(),
            max_context_files: default_max_context_files(),
            max_chars_per_file: default_max_chars_per_file(),
        }
    }
}

/// Settings for the run controller and repository mutator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Attempts per run, counting both error retries and CI re-attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Overall wall-clock deadline for the run, including the CI wait.
    #[serde(default = "default_run_deadline")]
    pub run_deadline_secs: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    /// Where audit logs go. Defaults to a directory under the system temp dir.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    /// Remote to push to. `None` disables pushing.
    #[serde(default = "default_remote")]
    pub remote: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_run_deadline() -> u64 {
    3600
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_remote() -> Option<String> {
    Some("origin".to_string())
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            run_deadline_secs: default_run_deadline(),
            lock_timeout_secs: default_lock_timeout(),
            logs_dir: None,
            remote: default_remote(),
        }
    }
}

impl RunSettings {
    /// Returns the run deadline as a Duration.
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    /// Returns the branch lock timeout as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Returns the audit log directory, falling back to the temp dir.
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("code-agent").join("runs"))
    }
}

/// Settings for the CI watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSettings {
    #[serde(default = "default_poll_initial")]
    pub poll_initial_secs: u64,
    #[serde(default = "default_poll_max")]
    pub poll_max_secs: u64,
    /// Window after a push in which check runs may still register. CI never
    /// settles inside it; with no checks at all, its end means no CI.
    #[serde(default = "default_no_checks_grace")]
    pub no_checks_grace_secs: u64,
}

fn default_poll_initial() -> u64 {
    15
}

fn default_poll_max() -> u64 {
    120
}

fn default_no_checks_grace() -> u64 {
    180
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            poll_initial_secs: default_poll_initial(),
            poll_max_secs: default_poll_max(),
            no_checks_grace_secs: default_no_checks_grace(),
        }
    }
}

impl CiSettings {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_secs(self.poll_initial_secs)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_secs(self.poll_max_secs)
    }

    pub fn no_checks_grace(&self) -> Duration {
        Duration::from_secs(self.no_checks_grace_secs)
    }
}

/// Contents of the optional TOML tuning file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub ci: CiSettings,
}

impl TuningConfig {
    /// Parses a tuning file from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid tuning file: {}", e)))
    }

    /// Loads a tuning file, returning defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = ?path, "no tuning file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = ?path, "loaded tuning file");
        Ok(config)
    }
}

impl Validate for TuningConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.run.max_attempts == 0 {
            result.add_error("run.max_attempts must be at least 1");
        }
        if self.model.max_provider_retries == 0 {
            result.add_error("model.max_provider_retries must be at least 1");
        }
        if self.model.max_tokens == 0 {
            result.add_error("model.max_tokens must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            result.add_error("model.temperature must be between 0.0 and 2.0");
        }
        if self.prompt.max_prompt_tokens < 256 {
            result.add_error("prompt.max_prompt_tokens must be at least 256");
        }
        if self.model.provider == ProviderKind::Scripted && self.model.scripted_responses.is_empty()
        {
            result.add_error("model.provider = \"scripted\" needs model.scripted_responses");
        }
        if self.run.max_attempts > 10 {
            result.add_warning("run.max_attempts above 10 may burn a lot of model credits");
        }
        if self.run.run_deadline_secs < self.model.request_timeout_secs {
            result.add_warning("run.run_deadline_secs is shorter than a single model call");
        }

        result
    }
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub openrouter_api_key: Secret,
    pub github_token: Secret,
    pub repository: RepoRef,
    pub issue_number: u64,
    /// Primary model id.
    pub model: String,
    pub base_branch: String,
    /// REST API root, `https://api.github.com` unless running on GitHub Enterprise.
    pub github_api_url: String,
    /// Root of the git checkout the agent mutates.
    pub workdir: PathBuf,
    pub tuning: TuningConfig,
}

impl AgentConfig {
    /// Builds the configuration from environment-style key/value pairs.
    ///
    /// Missing credentials fail with [`Error::CredentialMissing`]; missing or
    /// malformed repository coordinates fail with [`Error::Config`].
    pub fn from_vars(
        vars: &HashMap<String, String>,
        workdir: PathBuf,
        tuning: TuningConfig,
    ) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let openrouter_api_key = get("OPENROUTER_API_KEY")
            .map(|v| Secret::new("OPENROUTER_API_KEY", v))
            .ok_or_else(|| Error::CredentialMissing("OPENROUTER_API_KEY".to_string()))?;
        let github_token = get("GITHUB_TOKEN")
            .map(|v| Secret::new("GITHUB_TOKEN", v))
            .ok_or_else(|| Error::CredentialMissing("GITHUB_TOKEN".to_string()))?;

        let repository: RepoRef = get("GITHUB_REPOSITORY")
            .ok_or_else(|| Error::Config("GITHUB_REPOSITORY is not set".to_string()))?
            .parse()?;

        let issue_raw = get("ISSUE_NUMBER")
            .ok_or_else(|| Error::Config("ISSUE_NUMBER is not set".to_string()))?;
        let issue_number = issue_raw.parse::<u64>().map_err(|_| {
            Error::Config(format!("ISSUE_NUMBER must be a number, got '{}'", issue_raw))
        })?;

        let config = Self {
            openrouter_api_key,
            github_token,
            repository,
            issue_number,
            model: get("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_branch: get("BASE_BRANCH").unwrap_or_else(|| "main".to_string()),
            github_api_url: get("GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            workdir,
            tuning,
        };

        for warning in config.tuning.validate().into_result()? {
            tracing::warn!(warning = %warning, "tuning configuration");
        }

        Ok(config)
    }

    /// Overrides the primary model (the CLI `--model` flag).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Branch the run commits to.
    pub fn branch_name(&self) -> String {
        format!("issue-{}", self.issue_number)
    }

    /// Model ids in the order they are tried: primary first, then fallbacks without duplicates.
    pub fn model_chain(&self) -> Vec<String> {
        let mut chain = vec![self.model.clone()];
        for model in &self.tuning.model.fallback_models {
            if !chain.contains(model) {
                chain.push(model.clone());
            }
        }
        chain
    }

    /// All credentials, for building a redactor.
    pub fn secrets(&self) -> [&Secret; 2] {
        [&self.openrouter_api_key, &self.github_token]
    }
}
