//! Error types for the block indexing engine.

use thiserror::Error;

/// Errors that can occur while syncing or reorganising indexes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexerError {
    /// The chain source could not be reached or returned garbage.
    #[error("chain source error: {0}")]
    ChainSource(String),

    #[error("not found: {what}")]
    NotFound { what: String },

    /// A batch commit (or a read) against the index store failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("index service '{service}' failed: {reason}")]
    Service { service: String, reason: String },

    /// The two chains share no reachable ancestor.
    #[error("unknown common ancestor between {old} and {new}")]
    UnknownCommonAncestor { old: String, new: String },

    #[error("engine aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn service(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::Service {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for fetch failures that a later notification may cure.
    ///
    /// Nothing is lost on these: every commit is atomic, so the next sync
    /// attempt resumes from the last committed tip.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChainSource(_) | Self::NotFound { .. })
    }

    /// Returns `true` if the engine must stop advancing until restarted.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("codec: {e}"))
    }
}
