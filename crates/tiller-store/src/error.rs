//! Error types for the storage layer.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested document was not found, or a transaction assertion
    /// referenced a document that no longer exists.
    #[error("document not found")]
    NotFound,

    /// A transaction assertion failed against an existing document:
    /// another writer changed state the transaction depended on. The
    /// caller may refetch and retry.
    #[error("transaction aborted: assertion failed")]
    Aborted,

    /// A transaction op was malformed (e.g. pushing onto a non-array
    /// field). The transaction was not applied.
    #[error("invalid operation: {0}")]
    InvalidOp(String),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if this error is the optimistic-concurrency abort
    /// condition, resolvable by refetch-and-retry.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns true if the referenced document was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
