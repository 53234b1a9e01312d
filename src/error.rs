//! Error types.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can be reported by the cache, its stores and sources.
///
/// Errors are cheap to clone so one failure can be delivered to every waiter
/// of a shared request.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// The operation was canceled before it settled.
    #[error("operation canceled")]
    Canceled,

    /// The cache could not initialize and is permanently unusable.
    #[error("{message}")]
    CacheFailure {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("key already exists in store: {0}")]
    KeyExists(String),

    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("serialization error: {0}")]
    Serde(#[source] Arc<serde_json::Error>),

    #[error("no async runtime available: {0}")]
    Runtime(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn failure(message: impl Into<String>, source: Option<Error>) -> Self {
        Self::CacheFailure {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// Returns true if this error marks a canceled operation rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_failure_keeps_source() {
        let err = Error::failure(
            "Unable to read settings from store.",
            Some(Error::Store("disk gone".into())),
        );
        assert_eq!(err.to_string(), "Unable to read settings from store.");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("store error: disk gone"));
        assert!(!err.is_canceled());
        assert!(Error::Canceled.is_canceled());
    }
}
