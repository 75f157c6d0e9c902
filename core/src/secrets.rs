//! Credential handling.
//!
//! Credentials are wrapped in [`Secret`] so they cannot reach logs through
//! `Debug` or `Display`, and free-form text that may echo them back (HTTP
//! error bodies, git stderr) goes through a [`Redactor`] first.

use std::fmt;

/// A credential value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    name: String,
    value: String,
}

impl Secret {
    /// Wraps a credential under the name it was provided as (e.g. `GITHUB_TOKEN`).
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the name of the credential.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw value. Only call this when building an outgoing request.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({}: [REDACTED])", self.name)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED:{}]", self.name)
    }
}

/// Replaces known secret values in free-form text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Secrets sorted by value length descending so longer values are replaced first.
    secrets: Vec<Secret>,
}

impl Redactor {
    /// Creates an empty redactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a redactor for the given secrets.
    pub fn with_secrets<'a>(secrets: impl IntoIterator<Item = &'a Secret>) -> Self {
        let mut redactor = Self::new();
        for secret in secrets {
            redactor.add(secret.clone());
        }
        redactor
    }

    /// Registers a secret for redaction. Empty values are ignored.
    pub fn add(&mut self, secret: Secret) {
        if secret.value.is_empty() || self.secrets.iter().any(|s| s.value == secret.value) {
            return;
        }
        self.secrets.push(secret);
        self.secrets
            .sort_by(|a, b| b.value.len().cmp(&a.value.len()));
    }

    /// Redacts all known secret values from a string.
    ///
    /// Secret values are replaced with `[REDACTED:<name>]`.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for secret in &self.secrets {
            result = result.replace(&secret.value, &format!("[REDACTED:{}]", secret.name));
        }
        result
    }

    /// Returns the number of registered secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Returns true if no secrets are registered.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}
