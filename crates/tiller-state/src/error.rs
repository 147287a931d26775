//! Error types for the state layer.
//!
//! Errors surface to callers in three main conditions: not-found (the
//! entity or document is absent), not-valid (malformed caller input,
//! rejected before any I/O) and conflict (an optimistic transaction
//! assertion failed). Presence adds its own conditions: a wait timeout,
//! a failed presence watcher, and the fatal double-dead invariant
//! violation. Low-level store errors are wrapped with entity-identifying
//! context before they cross this boundary.

use thiserror::Error;
use tiller_core::IdError;
use tiller_store::StoreError;

/// A result type using `StateError`.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur in state layer operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The entity or document is absent: removed, or never existed.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// Malformed caller input, rejected before any store access.
    #[error("{what} not valid")]
    NotValid {
        /// Description of the invalid input.
        what: String,
    },

    /// An optimistic transaction assertion failed and retries were
    /// exhausted. Recoverable by refetch-and-retry for idempotent
    /// intents.
    #[error("{what}")]
    Conflict {
        /// Description of the conflicting condition.
        what: String,
    },

    /// A presence wait exceeded its deadline. Distinct from watcher
    /// failure so callers can tell "still starting" from "broken".
    #[error("still not alive after timeout")]
    StillNotAlive,

    /// The presence watcher has permanently failed; replayed to every
    /// current and future observer.
    #[error("presence watcher failed: {0}")]
    PresenceFailed(String),

    /// The presence layer reported dead twice in a row: an invariant
    /// violation. Fatal, never retried.
    #[error("presence reported dead status twice in a row for {key}")]
    DoubleDead {
        /// The global key the reports were observed for.
        key: String,
    },

    /// A watcher background loop failed; replayed to every current and
    /// future subscriber.
    #[error("watcher failed: {0}")]
    WatcherFailed(String),

    /// Entity-identifying context wrapped around a lower-level failure.
    #[error("cannot {op}: {source}")]
    Op {
        /// The operation that failed.
        op: String,
        /// The underlying failure.
        source: Box<StateError>,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl StateError {
    /// A not-found condition for the described entity.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// A not-valid condition for the described input.
    #[must_use]
    pub fn not_valid(what: impl Into<String>) -> Self {
        Self::NotValid { what: what.into() }
    }

    /// A conflict condition.
    #[must_use]
    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict { what: what.into() }
    }

    /// Returns true if this error (possibly through context wrapping) is
    /// a not-found condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Store(StoreError::NotFound) => true,
            Self::Op { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if this error is a validation rejection.
    #[must_use]
    pub fn is_not_valid(&self) -> bool {
        match self {
            Self::NotValid { .. } => true,
            Self::Op { source, .. } => source.is_not_valid(),
            _ => false,
        }
    }

    /// Returns true if this error is an optimistic-concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Store(StoreError::Aborted) => true,
            Self::Op { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Returns true if this error is the presence wait timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::StillNotAlive => true,
            Self::Op { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns true if this error is fatal and must not be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DoubleDead { .. } => true,
            Self::Op { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<IdError> for StateError {
    fn from(err: IdError) -> Self {
        let what = match err {
            IdError::InvalidApplicationName(name) => format!("application name {name:?}"),
            IdError::InvalidUnitName(name) => format!("unit name {name:?}"),
            IdError::InvalidNumericId(id) => format!("entity id {id:?}"),
        };
        Self::NotValid { what }
    }
}

/// Extension adding entity-identifying context to results crossing the
/// state-layer boundary.
pub(crate) trait ResultExt<T> {
    /// Wrap the error with "cannot {op}" context.
    fn op_context(self, op: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E: Into<StateError>> ResultExt<T> for std::result::Result<T, E> {
    fn op_context(self, op: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|err| StateError::Op {
            op: op(),
            source: Box::new(err.into()),
        })
    }
}
