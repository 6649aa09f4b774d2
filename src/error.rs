//! Crate-level error types for running projections.

use crate::checkpoint::CheckpointError;
use crate::chronicler::ChroniclerError;
use crate::options::OptionsError;
use crate::repository::RepositoryError;

/// Boxed error returned by user reaction code.
pub type ReactionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when building or running a projector fails.
///
/// Every variant is fatal to the current run. Conditions the engine recovers
/// from locally (a missing stream, a gap still within its retry budget, a
/// failed lock release during cleanup) never surface as a `ProjectionError`.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Another runner holds a live lock on this projection.
    ///
    /// Always propagated as-is; the run loop never retries or swallows it.
    #[error("projection '{0}' is already running")]
    AlreadyRunning(String),

    /// The named projection has no durable record.
    #[error("projection '{0}' not found")]
    NotFound(String),

    /// A checkpoint update was rejected (outdated position, gap violation).
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The event store failed.
    #[error(transparent)]
    Chronicler(#[from] ChroniclerError),

    /// The projection repository failed.
    #[error(transparent)]
    Repository(RepositoryError),

    /// Projector options failed validation.
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// User reaction code returned an error.
    #[error("reaction failed: {0}")]
    Reaction(#[source] ReactionError),

    /// Projection state could not be converted to or from JSON.
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A projector was built without selecting any stream.
    #[error("no streams selected: call from_streams, from_categories or from_all")]
    MissingScope,

    /// A persistence activity ran on a projector without durable storage.
    #[error("projection has no durable store attached")]
    NotPersistent,
}

impl ProjectionError {
    /// Returns `true` for the lock-conflict variant.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_))
    }
}

// Lock conflicts and missing records are lifted to their dedicated variants
// so callers can match on them without digging into the repository error.
impl From<RepositoryError> for ProjectionError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::AlreadyRunning(name) => Self::AlreadyRunning(name),
            RepositoryError::NotFound(name) => Self::NotFound(name),
            other => Self::Repository(other),
        }
    }
}
