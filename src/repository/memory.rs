use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{CheckpointRecorder, ProjectionRecord, ProjectionRepository, RepositoryError};
use crate::checkpoint::{CheckpointId, CheckpointRecord};
use crate::status::ProjectionStatus;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, ProjectionRecord>,
    snapshots: HashMap<CheckpointId, CheckpointRecord>,
}

/// [`ProjectionRepository`] and [`CheckpointRecorder`] kept in memory.
///
/// Clones share the same records, so a manager and several projectors
/// built from clones see each other's writes (and each other's locks).
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionRepository {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryProjectionRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint snapshots recorded so far.
    pub async fn snapshot_count(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }

    async fn modify<F>(&self, name: &str, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut ProjectionRecord) -> Result<(), RepositoryError> + Send,
    {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(name)
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))?;
        f(record)
    }
}

#[async_trait]
impl ProjectionRepository for InMemoryProjectionRepository {
    async fn create(&self, name: &str, status: ProjectionStatus) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(name) {
            return Err(RepositoryError::AlreadyExists(name.to_owned()));
        }
        inner
            .records
            .insert(name.to_owned(), ProjectionRecord::new(name, status));
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.inner.lock().await.records.contains_key(name))
    }

    async fn load(&self, name: &str) -> Result<ProjectionRecord, RepositoryError> {
        self.inner
            .lock()
            .await
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))
    }

    async fn acquire_lock(
        &self,
        name: &str,
        status: ProjectionStatus,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| record.lock(status, locked_until, now))
            .await
    }

    async fn update_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.locked_until = Some(locked_until);
            Ok(())
        })
        .await
    }

    async fn persist(
        &self,
        name: &str,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.state = state;
            record.checkpoints = checkpoints;
            record.locked_until = Some(locked_until);
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.status = status;
            Ok(())
        })
        .await
    }

    async fn start_again(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.status = ProjectionStatus::Running;
            record.locked_until = Some(locked_until);
            Ok(())
        })
        .await
    }

    async fn reset(
        &self,
        name: &str,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
        status: ProjectionStatus,
    ) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.state = state;
            record.checkpoints = checkpoints;
            record.status = status;
            Ok(())
        })
        .await
    }

    async fn release(&self, name: &str) -> Result<(), RepositoryError> {
        self.modify(name, |record| {
            record.unlock();
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .records
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))
    }

    async fn names(&self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.inner.lock().await.records.keys().cloned().collect())
    }
}

#[async_trait]
impl CheckpointRecorder for InMemoryProjectionRepository {
    async fn record(
        &self,
        projection: &str,
        checkpoint: &CheckpointRecord,
    ) -> Result<CheckpointId, RepositoryError> {
        let id = CheckpointId::new(projection, &checkpoint.stream_name, checkpoint.position);
        self.inner
            .lock()
            .await
            .snapshots
            .insert(id, checkpoint.clone());
        Ok(id)
    }

    async fn recorded(
        &self,
        id: CheckpointId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self.inner.lock().await.snapshots.get(&id).cloned())
    }
}
