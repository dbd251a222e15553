//! Error types for Ruleplane

use thiserror::Error;

/// Result type alias using Ruleplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// Ruleplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id} - it must be imported into state to be managed")]
    AlreadyExists { kind: String, id: String },

    #[error("Malformed identity {input:?}: {reason}")]
    MalformedIdentity { input: String, reason: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Remote operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Remote operation {operation} did not converge within {seconds}s")]
    ConvergenceTimeout { operation: String, seconds: u64 },

    #[error("Operation timeout after {seconds}s waiting for {waiting_on}")]
    Timeout { waiting_on: String, seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedIdentity {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Wrap this error with a description of what was being worked on
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    /// Whether retrying the whole operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::Remote(_) | Error::Timeout { .. } | Error::ConvergenceTimeout { .. }
        )
    }
}

/// Attach context to the error side of a result
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_sees_through_context() {
        let err = Error::not_found("firewall", "fw1")
            .context("reading network rule collection r1")
            .context("refreshing state");

        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert_eq!(
            err.to_string(),
            "refreshing state: reading network rule collection r1: Resource not found: firewall with id fw1"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Remote("connection reset".into()).is_transient());
        assert!(Error::ConvergenceTimeout { operation: "op".into(), seconds: 5 }
            .context("creating r1")
            .is_transient());
        assert!(!Error::malformed("/x", "too short").is_transient());
        assert!(!Error::already_exists("nat rule collection", "n1").is_transient());
    }
}
