use std::sync::Arc;

use serde_json::Value;

use super::{CheckpointRecorder, ProjectionRecord, ProjectionRepository, RepositoryError};
use crate::checkpoint::CheckpointRecord;
use crate::lock::LockManager;
use crate::status::ProjectionStatus;

/// Repository access for one named projection.
///
/// Composes the shared [`ProjectionRepository`] with this projector's
/// [`LockManager`] and an optional [`CheckpointRecorder`], so every write
/// carries a fresh lock expiry and every persisted checkpoint can be
/// snapshotted.
#[derive(Debug, Clone)]
pub struct ProjectionStore {
    name: String,
    repository: Arc<dyn ProjectionRepository>,
    recorder: Option<Arc<dyn CheckpointRecorder>>,
    lock: LockManager,
}

impl ProjectionStore {
    /// Store for the projection `name`, taking locks through `lock`.
    pub fn new(
        name: impl Into<String>,
        repository: Arc<dyn ProjectionRepository>,
        lock: LockManager,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            recorder: None,
            lock,
        }
    }

    /// Snapshot every persisted checkpoint through `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn CheckpointRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Projection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock bookkeeping of this projector.
    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Returns `true` if the durable record exists.
    pub async fn exists(&self) -> Result<bool, RepositoryError> {
        self.repository.exists(&self.name).await
    }

    /// Create the record as idle.
    pub async fn create(&self) -> Result<(), RepositoryError> {
        self.repository
            .create(&self.name, ProjectionStatus::Idle)
            .await?;
        tracing::info!(projection = %self.name, "projection created");
        Ok(())
    }

    /// Read the durable record.
    pub async fn load(&self) -> Result<ProjectionRecord, RepositoryError> {
        self.repository.load(&self.name).await
    }

    /// Read only the durable status.
    pub async fn load_status(&self) -> Result<ProjectionStatus, RepositoryError> {
        Ok(self.load().await?.status)
    }

    /// Take the lock and mark the projection running.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::AlreadyRunning`] while another runner's
    /// lock is live.
    pub async fn acquire_lock(&mut self) -> Result<(), RepositoryError> {
        let now = self.lock.now();
        let locked_until = self.lock.acquire();
        if let Err(e) = self
            .repository
            .acquire_lock(&self.name, ProjectionStatus::Running, locked_until, now)
            .await
        {
            self.lock.release();
            return Err(e);
        }
        tracing::debug!(projection = %self.name, %locked_until, "lock acquired");
        Ok(())
    }

    /// Push the lock forward if `lockout` has elapsed since the last write.
    ///
    /// Returns whether a write happened.
    pub async fn update_lock(&mut self) -> Result<bool, RepositoryError> {
        if !self.lock.should_refresh() {
            return Ok(false);
        }
        let locked_until = self.lock.refresh();
        self.repository.update_lock(&self.name, locked_until).await?;
        Ok(true)
    }

    /// Store state and checkpoints under a refreshed lock.
    pub async fn persist(
        &mut self,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
    ) -> Result<(), RepositoryError> {
        let locked_until = self.lock.refresh();
        if let Some(recorder) = &self.recorder {
            for checkpoint in checkpoints.iter().filter(|c| c.position > 0) {
                recorder.record(&self.name, checkpoint).await?;
            }
        }
        let streams = checkpoints.len();
        self.repository
            .persist(&self.name, state, checkpoints, locked_until)
            .await?;
        tracing::debug!(projection = %self.name, streams, "projection persisted");
        Ok(())
    }

    /// Mark running again under a fresh lock.
    pub async fn start_again(&mut self) -> Result<(), RepositoryError> {
        let locked_until = self.lock.acquire();
        self.repository.start_again(&self.name, locked_until).await
    }

    /// Overwrite state, checkpoints and status, keeping the lock as is.
    pub async fn reset(
        &self,
        state: Value,
        checkpoints: Vec<CheckpointRecord>,
        status: ProjectionStatus,
    ) -> Result<(), RepositoryError> {
        self.repository
            .reset(&self.name, state, checkpoints, status)
            .await
    }

    /// Write a target status without touching state or lock.
    pub async fn update_status(&self, status: ProjectionStatus) -> Result<(), RepositoryError> {
        self.repository.update_status(&self.name, status).await
    }

    /// Drop the lock and go idle.
    pub async fn release(&mut self) -> Result<(), RepositoryError> {
        self.repository.release(&self.name).await?;
        self.lock.release();
        tracing::debug!(projection = %self.name, "lock released");
        Ok(())
    }

    /// Remove the durable record and forget the lock.
    pub async fn delete(&mut self) -> Result<(), RepositoryError> {
        self.repository.delete(&self.name).await?;
        self.lock.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointId;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::{at, epoch};
    use crate::repository::InMemoryProjectionRepository;

    fn store(
        repo: &InMemoryProjectionRepository,
        clock: &ManualClock,
        lockout_ms: i64,
    ) -> ProjectionStore {
        let lock = LockManager::new(
            Arc::new(clock.clone()),
            chrono::Duration::seconds(10),
            chrono::Duration::milliseconds(lockout_ms),
        );
        ProjectionStore::new("balances", Arc::new(repo.clone()), lock)
    }

    #[tokio::test]
    async fn second_runner_is_rejected_until_lock_expires() {
        let repo = InMemoryProjectionRepository::new();
        let clock = ManualClock::new(epoch());
        let mut first = store(&repo, &clock, 0);
        let mut second = store(&repo, &clock, 0);

        first.create().await.expect("create");
        first.acquire_lock().await.expect("first runner locks");

        clock.advance(chrono::Duration::seconds(5));
        let err = second.acquire_lock().await.expect_err("lock is live");
        assert!(matches!(err, RepositoryError::AlreadyRunning(_)));
        assert_eq!(second.lock().current(), None);

        clock.advance(chrono::Duration::seconds(6));
        second.acquire_lock().await.expect("stale lock is reclaimed");
        assert_eq!(repo.load("balances").await.expect("load").locked_until, Some(at(21)));
    }

    #[tokio::test]
    async fn update_lock_honours_lockout() {
        let repo = InMemoryProjectionRepository::new();
        let clock = ManualClock::new(epoch());
        let mut store = store(&repo, &clock, 3000);
        store.create().await.expect("create");
        store.acquire_lock().await.expect("lock");

        clock.advance(chrono::Duration::seconds(1));
        assert!(!store.update_lock().await.expect("update"));

        clock.advance(chrono::Duration::seconds(2));
        assert!(store.update_lock().await.expect("update"));
        assert_eq!(repo.load("balances").await.expect("load").locked_until, Some(at(13)));
    }

    #[tokio::test]
    async fn persist_records_checkpoint_snapshots() {
        let repo = InMemoryProjectionRepository::new();
        let clock = ManualClock::new(epoch());
        let mut store = store(&repo, &clock, 0).with_recorder(Arc::new(repo.clone()));
        store.create().await.expect("create");
        store.acquire_lock().await.expect("lock");

        let checkpoints = vec![
            CheckpointRecord {
                stream_name: "account-1".to_string(),
                position: 3,
                created_at: at(0),
                gaps: vec![],
            },
            CheckpointRecord {
                stream_name: "account-2".to_string(),
                position: 0,
                created_at: at(0),
                gaps: vec![],
            },
        ];
        store
            .persist(serde_json::json!({"total": 3}), checkpoints)
            .await
            .expect("persist");

        assert_eq!(repo.snapshot_count().await, 1);
        let id = CheckpointId::new("balances", "account-1", 3);
        assert!(repo.recorded(id).await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn release_goes_idle_and_unlocks() {
        let repo = InMemoryProjectionRepository::new();
        let clock = ManualClock::new(epoch());
        let mut store = store(&repo, &clock, 0);
        store.create().await.expect("create");
        store.acquire_lock().await.expect("lock");
        assert_eq!(store.load_status().await.expect("status"), ProjectionStatus::Running);

        store.release().await.expect("release");
        let record = repo.load("balances").await.expect("load");
        assert_eq!(record.status, ProjectionStatus::Idle);
        assert_eq!(record.locked_until, None);
    }
}
