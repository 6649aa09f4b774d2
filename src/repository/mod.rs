//! Durable projection records and checkpoint snapshots.
//!
//! A persistent projection owns one [`ProjectionRecord`]: its status, folded
//! state, checkpoints and lock expiry. [`ProjectionRepository`] is the narrow
//! contract the engine needs from whatever stores those records;
//! [`CheckpointRecorder`] optionally keeps an idempotent audit trail of every
//! checkpoint value persisted.
//!
//! Two backends ship with the crate: [`InMemoryProjectionRepository`] and
//! [`JsonFileRepository`]. The per-projection facade the engine talks to is
//! [`ProjectionStore`].

mod file;
mod memory;
mod store;

pub use file::JsonFileRepository;
pub use memory::InMemoryProjectionRepository;
pub use store::ProjectionStore;

use std::fmt;
use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{CheckpointId, CheckpointRecord};
use crate::status::ProjectionStatus;

/// Error returned by repositories and checkpoint recorders.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("projection '{0}' not found")]
    NotFound(String),

    #[error("projection '{0}' already exists")]
    AlreadyExists(String),

    /// The name cannot be stored by this repository, e.g. it is not a single
    /// path component.
    #[error("invalid projection name '{0}'")]
    InvalidName(String),

    /// Another runner holds a lock that has not expired yet.
    #[error("projection '{0}' is already running")]
    AlreadyRunning(String),

    #[error("repository I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("repository serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable row of one persistent projection.
///
/// Serialized as
/// `{"name": "...", "status": "running", "state": {...}, "checkpoints": [...], "locked_until": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub name: String,
    pub status: ProjectionStatus,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
}

impl ProjectionRecord {
    /// A fresh, unlocked record with no state and no checkpoints.
    pub fn new(name: impl Into<String>, status: ProjectionStatus) -> Self {
        Self {
            name: name.into(),
            status,
            state: Value::Null,
            checkpoints: Vec::new(),
            locked_until: None,
        }
    }

    /// Returns `true` while a lock is held and has not expired at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Take the lock until `locked_until` and switch to `status`.
    ///
    /// An expired lock is reclaimed silently: its holder is presumed dead.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::AlreadyRunning`] if the current lock is live.
    pub fn lock(
        &mut self,
        status: ProjectionStatus,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if self.is_locked(now) {
            return Err(RepositoryError::AlreadyRunning(self.name.clone()));
        }
        if self.locked_until.is_some() {
            tracing::warn!(projection = %self.name, "reclaiming stale lock");
        }
        self.status = status;
        self.locked_until = Some(locked_until);
        Ok(())
    }

    /// Drop the lock and go back to idle.
    pub fn unlock(&mut self) {
        self.status = ProjectionStatus::Idle;
        self.locked_until = None;
    }
}

/// Storage of [`ProjectionRecord`]s keyed by projection name.
///
/// Every operation other than [`create`](Self::create),
/// [`exists`](Self::exists) and [`names`](Self::names) fails with
/// [`RepositoryError::NotFound`] when the record is missing.
#[async_trait]
pub trait ProjectionRepository: Send + Sync + fmt::Debug {
    /// Create an unlocked record with `status`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::AlreadyExists`] if the name is taken.
    async fn create(&self, name: &str, status: ProjectionStatus) -> Result<(), RepositoryError>;

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError>;

    async fn load(&self, name: &str) -> Result<ProjectionRecord, RepositoryError>;

    /// Atomically take the lock (see [`ProjectionRecord::lock`]).
    async fn acquire_lock(
        &self,
        name: &str,
        status: ProjectionStatus,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Push the lock expiry forward without touching state.
    async fn update_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Store state and checkpoints and push the lock expiry forward.
    async fn persist(
        &self,
        name: &str,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn update_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Result<(), RepositoryError>;

    /// Mark the projection running again under a fresh lock, after a reset.
    async fn start_again(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Overwrite state, checkpoints and status in one write.
    async fn reset(
        &self,
        name: &str,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
        status: ProjectionStatus,
    ) -> Result<(), RepositoryError>;

    /// Clear the lock and set the status to idle.
    async fn release(&self, name: &str) -> Result<(), RepositoryError>;

    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;

    async fn names(&self) -> Result<Vec<String>, RepositoryError>;
}

/// Idempotent store of checkpoint snapshots keyed by [`CheckpointId`].
///
/// Recording the same `(projection, stream, position)` twice overwrites the
/// same entry, so replays never duplicate audit rows.
#[async_trait]
pub trait CheckpointRecorder: Send + Sync + fmt::Debug {
    async fn record(
        &self,
        projection: &str,
        checkpoint: &CheckpointRecord,
    ) -> Result<CheckpointId, RepositoryError>;

    async fn recorded(&self, id: CheckpointId)
    -> Result<Option<CheckpointRecord>, RepositoryError>;
}
