use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{CheckpointRecorder, ProjectionRecord, ProjectionRepository, RepositoryError};
use crate::checkpoint::{CheckpointId, CheckpointRecord};
use crate::status::ProjectionStatus;

const RECORD_FILE: &str = "projection.json";

/// [`ProjectionRepository`] and [`CheckpointRecorder`] storing JSON files.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     projections/
///         <name>/
///             projection.json     -- ProjectionRecord
///     checkpoints/
///         <checkpoint_id>.json    -- CheckpointRecord snapshots
/// ```
///
/// Every write goes to a `.tmp` sibling first and is renamed into place, so
/// a crash never leaves a half-written record. A record that fails to parse
/// is logged and treated as absent, and the projection rebuilds from scratch.
///
/// Read-modify-write cycles are serialized within the process. Across
/// processes the lock check is only as atomic as the file system rename.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    base_dir: PathBuf,
    guard: Arc<Mutex<()>>,
}

impl JsonFileRepository {
    /// Create a repository rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; it is created lazily on the
    /// first write. Projection names are used as directory names and must be
    /// valid path components.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Root directory of the repository.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns `<base_dir>/projections/<name>`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidName`] unless `name` is a single,
    /// non-empty path component, so a record never lands outside `base_dir`.
    pub fn projection_dir(&self, name: &str) -> Result<PathBuf, RepositoryError> {
        let single_component = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !single_component {
            return Err(RepositoryError::InvalidName(name.to_owned()));
        }
        Ok(self.base_dir.join("projections").join(name))
    }

    fn record_path(&self, name: &str) -> Result<PathBuf, RepositoryError> {
        Ok(self.projection_dir(name)?.join(RECORD_FILE))
    }

    fn snapshot_path(&self, id: CheckpointId) -> PathBuf {
        self.base_dir.join("checkpoints").join(format!("{id}.json"))
    }

    async fn load_record(&self, name: &str) -> Result<Option<ProjectionRecord>, RepositoryError> {
        Ok(load_json(&self.record_path(name)?).await?)
    }

    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), RepositoryError> {
        Ok(save_json(&self.record_path(&record.name)?, record).await?)
    }

    async fn modify<F>(&self, name: &str, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut ProjectionRecord) -> Result<(), RepositoryError> + Send,
    {
        let _guard = self.guard.lock().await;
        let mut record = self
            .load_record(name)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))?;
        f(&mut record)?;
        self.save_record(&record).await?;
        Ok(())
    }
}

/// Write `value` as pretty JSON to `path` atomically, creating parent dirs.
async fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read JSON from `path`.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt.
async fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt projection file, treating as absent"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ProjectionRepository for JsonFileRepository {
    async fn create(&self, name: &str, status: ProjectionStatus) -> Result<(), RepositoryError> {
        let _guard = self.guard.lock().await;
        if self.load_record(name).await?.is_some() {
            return Err(RepositoryError::AlreadyExists(name.to_owned()));
        }
        self.save_record(&ProjectionRecord::new(name, status)).await?;
        tracing::debug!(projection = %name, base_dir = %self.base_dir.display(), "projection record created");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.load_record(name).await?.is_some())
    }

    async fn load(&self, name: &str) -> Result<ProjectionRecord, RepositoryError> {
        self.load_record(name)
            .await?
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
        let dir = self.projection_dir(name)?;
        let _guard = self.guard.lock().await;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RepositoryError::NotFound(name.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn names(&self) -> Result<Vec<String>, RepositoryError> {
        let dir = self.base_dir.join("projections");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && tokio::fs::try_exists(entry.path().join(RECORD_FILE)).await?
            {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl CheckpointRecorder for JsonFileRepository {
    async fn record(
        &self,
        projection: &str,
        checkpoint: &CheckpointRecord,
    ) -> Result<CheckpointId, RepositoryError> {
        let id = CheckpointId::new(projection, &checkpoint.stream_name, checkpoint.position);
        save_json(&self.snapshot_path(id), checkpoint).await?;
        Ok(id)
    }

    async fn recorded(
        &self,
        id: CheckpointId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(load_json(&self.snapshot_path(id)).await?)
    }
}
