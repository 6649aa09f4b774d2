//! Per-stream consumption cursors.
//!
//! A [`Checkpoint`] records the last position a projection consumed from one
//! stream together with the positions it skipped ("gaps"). Checkpoints are
//! only ever mutated through [`CheckpointStore`], which enforces the
//! monotonicity and gap-ordering invariants.

mod store;

pub use store::CheckpointStore;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace for deterministic checkpoint identities.
const CHECKPOINT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5c, 0x0e, 0x41, 0x92, 0x7a, 0xd3, 0x4f, 0x61, 0x9b, 0x27, 0xe8, 0x14, 0x3a, 0x6d, 0xc0, 0x55,
]);

/// Most positions a single confirmed jump may record as gaps.
pub const MAX_GAP_SPAN: u64 = 100_000;

/// Error raised when a checkpoint update would break an invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// The incoming position is not ahead of the recorded one.
    ///
    /// Indicates an ordering bug upstream; never retried.
    #[error("outdated position {position} for stream '{stream}': checkpoint is already at {current}")]
    Outdated {
        stream: String,
        position: u64,
        current: u64,
    },

    /// A newly computed gap is already recorded.
    #[error("gap {gap} is already recorded for stream '{stream}'")]
    DuplicateGap { stream: String, gap: u64 },

    /// A newly computed gap sorts before an already recorded one.
    #[error("gap {gap} for stream '{stream}' precedes recorded gap {last}")]
    GapOrdering { stream: String, gap: u64, last: u64 },

    /// A confirmed jump would record more than [`MAX_GAP_SPAN`] gaps.
    #[error("jump from {current} to {position} on stream '{stream}' skips more than {MAX_GAP_SPAN} positions")]
    GapTooLarge {
        stream: String,
        position: u64,
        current: u64,
    },

    /// The stream has not been discovered.
    #[error("stream '{0}' is not watched")]
    UnknownStream(String),
}

/// Consumption cursor for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    stream_name: String,
    position: u64,
    created_at: DateTime<Utc>,
    gaps: Vec<u64>,
}

impl Checkpoint {
    pub(crate) fn new(
        stream_name: impl Into<String>,
        position: u64,
        created_at: DateTime<Utc>,
        gaps: Vec<u64>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            position,
            created_at,
            gaps,
        }
    }

    /// Name of the stream this cursor belongs to.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Last consumed position; `0` before the first event.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// When this cursor value was produced.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Skipped positions, strictly increasing and all below [`position`](Self::position).
    pub fn gaps(&self) -> &[u64] {
        &self.gaps
    }

    /// Identity of this cursor value within `projection`.
    pub fn id(&self, projection: &str) -> CheckpointId {
        CheckpointId::new(projection, &self.stream_name, self.position)
    }
}

/// Deterministic identity of a checkpoint value.
///
/// A UUID v5 over `"{projection}/{stream}/{position}"`, so recording the same
/// cursor twice always lands on the same key.
///
/// # Examples
///
/// ```
/// use eventfold_projector::CheckpointId;
///
/// let a = CheckpointId::new("balances", "account-1", 42);
/// assert_eq!(a, CheckpointId::new("balances", "account-1", 42));
/// assert_ne!(a, CheckpointId::new("balances", "account-1", 43));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Derive the identity of `(projection, stream, position)`.
    pub fn new(projection: &str, stream_name: &str, position: u64) -> Self {
        let name = format!("{projection}/{stream_name}/{position}");
        Self(Uuid::new_v5(&CHECKPOINT_NAMESPACE, name.as_bytes()))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persisted shape of a [`Checkpoint`].
///
/// Serialized as
/// `{"stream_name": "...", "position": 4, "created_at": "2024-01-01T00:00:00Z", "gaps": [2]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub stream_name: String,
    pub position: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub gaps: Vec<u64>,
}

impl From<&Checkpoint> for CheckpointRecord {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            stream_name: checkpoint.stream_name.clone(),
            position: checkpoint.position,
            created_at: checkpoint.created_at,
            gaps: checkpoint.gaps.clone(),
        }
    }
}

impl From<CheckpointRecord> for Checkpoint {
    fn from(record: CheckpointRecord) -> Self {
        let mut gaps = record.gaps;
        gaps.sort_unstable();
        gaps.dedup();
        Self::new(record.stream_name, record.position, record.created_at, gaps)
    }
}
