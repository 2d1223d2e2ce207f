//! Error types for the migration engine.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Describe unavailable for object: {0}")]
    Describe(String),

    #[error("Unresolvable dependency among objects: {}", .0.join(", "))]
    UnresolvableDependency(Vec<String>),

    #[error("Transient remote error (retries exhausted): {0}")]
    Transient(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Backup is not restorable: {0}")]
    IncompleteBackup(String),

    #[error("Another operation is already running: {0}")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation task ended abnormally: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Whether the caller asked for this outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure classification at the remote API boundary.
///
/// The session manager decides what to retry based on the variant; nothing
/// above it ever sees a `RemoteError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The access token was rejected (expired or revoked).
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Credentials were refused outright; retrying will not help.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Network failure, rate limit or server-side hiccup.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("call timed out")]
    Timeout,

    /// The platform understood and refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout)
    }
}

/// A fatal error together with whatever finished before it.
#[derive(Debug)]
pub struct Aborted<S> {
    pub error: EngineError,
    pub partial: S,
}

impl<S> Aborted<S> {
    pub fn new(error: EngineError, partial: S) -> Self {
        Self { error, partial }
    }
}

impl<S> fmt::Display for Aborted<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation aborted: {}", self.error)
    }
}

impl<S: fmt::Debug> std::error::Error for Aborted<S> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Transient("503".into()).is_transient());
        assert!(!RemoteError::InvalidSession("expired".into()).is_transient());
        assert!(!RemoteError::Rejected("bad field".into()).is_transient());
    }

    #[test]
    fn test_unresolvable_message_lists_nodes() {
        let err = EngineError::UnresolvableDependency(vec!["A".into(), "B".into()]);
        assert_eq!(err.to_string(), "Unresolvable dependency among objects: A, B");
    }

    #[test]
    fn test_aborted_exposes_source() {
        use std::error::Error;
        let aborted = Aborted::new(EngineError::Cancelled, ());
        assert!(aborted.source().is_some());
        assert!(aborted.error.is_cancelled());
    }
}
