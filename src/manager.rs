//! Building projectors and operating on persisted projections.

use std::sync::Arc;

use crate::checkpoint::CheckpointRecord;
use crate::chronicler::Chronicler;
use crate::clock::{Clock, SystemClock};
use crate::emitter::Emitter;
use crate::error::ProjectionError;
use crate::lock::LockManager;
use crate::options::ProjectionOptions;
use crate::projection::Projection;
use crate::projector::{PersistentProjector, QueryProjector};
use crate::repository::{CheckpointRecorder, ProjectionRepository, ProjectionStore};
use crate::status::ProjectionStatus;
use crate::workflow::{StreamScope, Subscription};

/// Entry point wiring the event store, projection repository and clock into
/// projectors.
///
/// The manager also exposes the operator commands. [`stop`](Self::stop),
/// [`reset`](Self::reset) and [`delete`](Self::delete) only write a target
/// status; a running projector acts on it at its next status check, and an
/// idle one on its next start.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use eventfold_projector::{
///     InMemoryChronicler, JsonFileRepository, ProjectorManager, SystemClock,
/// };
/// # use eventfold_projector::{Projection, ReactionError, ReactionScope};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Deserialize)]
/// # #[serde(tag = "type", content = "data")]
/// # enum AccountEvent { Deposited { amount: i64 } }
/// # #[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// # struct Balance { total: i64 }
/// # impl Projection for Balance {
/// #     type Event = AccountEvent;
/// #     fn react(&mut self, event: AccountEvent, _: &mut ReactionScope<'_>) -> Result<(), ReactionError> {
/// #         let AccountEvent::Deposited { amount } = event;
/// #         self.total += amount;
/// #         Ok(())
/// #     }
/// # }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let chronicler = Arc::new(InMemoryChronicler::new(Arc::new(SystemClock)));
/// let repository = Arc::new(JsonFileRepository::new("./data"));
/// let manager = ProjectorManager::new(chronicler, repository);
///
/// let mut projector = manager
///     .projection::<Balance>("balances")
///     .from_categories(["account"])
///     .build()?;
/// projector.run(false).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProjectorManager {
    chronicler: Arc<dyn Chronicler>,
    repository: Arc<dyn ProjectionRepository>,
    recorder: Option<Arc<dyn CheckpointRecorder>>,
    clock: Arc<dyn Clock>,
    options: ProjectionOptions,
}

impl ProjectorManager {
    /// Manager on the system clock with default options.
    pub fn new(chronicler: Arc<dyn Chronicler>, repository: Arc<dyn ProjectionRepository>) -> Self {
        Self {
            chronicler,
            repository,
            recorder: None,
            clock: Arc::new(SystemClock),
            options: ProjectionOptions::default(),
        }
    }

    /// Clock used for locks, checkpoints and detection windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot every checkpoint persistent projectors write.
    pub fn with_recorder(mut self, recorder: Arc<dyn CheckpointRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Options every builder starts from.
    pub fn with_options(mut self, options: ProjectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Event store the projectors read from.
    pub fn chronicler(&self) -> &Arc<dyn Chronicler> {
        &self.chronicler
    }

    /// Repository holding projection records.
    pub fn repository(&self) -> &Arc<dyn ProjectionRepository> {
        &self.repository
    }

    /// Start building an in-memory query projector.
    pub fn query<P: Projection>(&self) -> QueryBuilder<P> {
        QueryBuilder {
            manager: self.clone(),
            scope: None,
            options: self.options.clone(),
            initial: P::default(),
        }
    }

    /// Start building a persistent projector named `name`.
    pub fn projection<P: Projection>(&self, name: impl Into<String>) -> ProjectionBuilder<P> {
        ProjectionBuilder::new(self.clone(), name.into(), false)
    }

    /// Start building a persistent projector that may emit events to a
    /// stream named `name`.
    pub fn emitter<P: Projection>(&self, name: impl Into<String>) -> ProjectionBuilder<P> {
        ProjectionBuilder::new(self.clone(), name.into(), true)
    }

    /// Ask the projection to persist and stop.
    pub async fn stop(&self, name: &str) -> Result<(), ProjectionError> {
        self.mark(name, ProjectionStatus::Stopping).await
    }

    /// Ask the projection to rebuild from scratch.
    pub async fn reset(&self, name: &str) -> Result<(), ProjectionError> {
        self.mark(name, ProjectionStatus::Resetting).await
    }

    /// Ask the projection to delete its record, and its emitted stream when
    /// `with_emitted_events` is set.
    pub async fn delete(&self, name: &str, with_emitted_events: bool) -> Result<(), ProjectionError> {
        let status = if with_emitted_events {
            ProjectionStatus::DeletingWithEmittedEvents
        } else {
            ProjectionStatus::Deleting
        };
        self.mark(name, status).await
    }

    async fn mark(&self, name: &str, status: ProjectionStatus) -> Result<(), ProjectionError> {
        self.repository.update_status(name, status).await?;
        tracing::info!(projection = %name, %status, "status requested");
        Ok(())
    }

    /// Durable status of `name`.
    pub async fn status_of(&self, name: &str) -> Result<ProjectionStatus, ProjectionError> {
        Ok(self.repository.load(name).await?.status)
    }

    /// Last persisted state; the default state if none was persisted yet.
    pub async fn state_of<P: Projection>(&self, name: &str) -> Result<P, ProjectionError> {
        let record = self.repository.load(name).await?;
        if record.state.is_null() {
            return Ok(P::default());
        }
        Ok(serde_json::from_value(record.state)?)
    }

    /// Last persisted checkpoints of `name`.
    pub async fn checkpoints_of(&self, name: &str) -> Result<Vec<CheckpointRecord>, ProjectionError> {
        Ok(self.repository.load(name).await?.checkpoints)
    }

    /// Names of every stored projection.
    pub async fn names(&self) -> Result<Vec<String>, ProjectionError> {
        Ok(self.repository.names().await?)
    }
}

/// Builder returned by [`ProjectorManager::query`].
#[derive(Debug)]
pub struct QueryBuilder<P: Projection> {
    manager: ProjectorManager,
    scope: Option<StreamScope>,
    options: ProjectionOptions,
    initial: P,
}

impl<P: Projection> QueryBuilder<P> {
    /// Read exactly the named streams.
    pub fn from_streams<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(StreamScope::Streams(names.into_iter().map(Into::into).collect()));
        self
    }

    /// Read every stream named `"{category}-..."`, including streams
    /// created after the projector starts.
    pub fn from_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(StreamScope::Categories(
            categories.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Read every stream in the store.
    pub fn from_all(mut self) -> Self {
        self.scope = Some(StreamScope::All);
        self
    }

    /// Replace the options inherited from the manager.
    pub fn with_options(mut self, options: ProjectionOptions) -> Self {
        self.options = options;
        self
    }

    /// State the projection starts from and returns to on reset.
    pub fn initial(mut self, state: P) -> Self {
        self.initial = state;
        self
    }

    /// # Errors
    ///
    /// Returns [`ProjectionError::MissingScope`] if no stream was selected,
    /// or [`ProjectionError::Options`] for invalid options.
    pub fn build(self) -> Result<QueryProjector<P>, ProjectionError> {
        let scope = self.scope.ok_or(ProjectionError::MissingScope)?;
        self.options.validate()?;
        let subscription = Subscription::new(
            self.options,
            scope,
            self.initial,
            self.manager.chronicler,
            self.manager.clock,
        )?;
        Ok(QueryProjector::new(subscription))
    }
}

/// Builder returned by [`ProjectorManager::projection`] and
/// [`ProjectorManager::emitter`].
#[derive(Debug)]
pub struct ProjectionBuilder<P: Projection> {
    manager: ProjectorManager,
    name: String,
    emitting: bool,
    scope: Option<StreamScope>,
    options: ProjectionOptions,
    initial: P,
}

impl<P: Projection> ProjectionBuilder<P> {
    fn new(manager: ProjectorManager, name: String, emitting: bool) -> Self {
        Self {
            options: manager.options.clone(),
            manager,
            name,
            emitting,
            scope: None,
            initial: P::default(),
        }
    }

    /// Read exactly the named streams.
    pub fn from_streams<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(StreamScope::Streams(names.into_iter().map(Into::into).collect()));
        self
    }

    /// Read every stream named `"{category}-..."`, including streams
    /// created after the projector starts.
    pub fn from_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(StreamScope::Categories(
            categories.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Read every stream in the store.
    pub fn from_all(mut self) -> Self {
        self.scope = Some(StreamScope::All);
        self
    }

    /// Replace the options inherited from the manager.
    pub fn with_options(mut self, options: ProjectionOptions) -> Self {
        self.options = options;
        self
    }

    /// State the projection starts from and returns to on reset.
    pub fn initial(mut self, state: P) -> Self {
        self.initial = state;
        self
    }

    /// # Errors
    ///
    /// Returns [`ProjectionError::MissingScope`] if no stream was selected,
    /// or [`ProjectionError::Options`] for invalid options.
    pub fn build(self) -> Result<PersistentProjector<P>, ProjectionError> {
        let scope = self.scope.ok_or(ProjectionError::MissingScope)?;
        self.options.validate()?;

        let lock = LockManager::new(
            Arc::clone(&self.manager.clock),
            self.options.lock_timeout(),
            self.options.lock_lockout(),
        );
        let mut store = ProjectionStore::new(self.name.clone(), self.manager.repository, lock);
        if let Some(recorder) = self.manager.recorder {
            store = store.with_recorder(recorder);
        }

        let cache_size = self.options.cache_size;
        let mut subscription = Subscription::new(
            self.options,
            scope,
            self.initial,
            Arc::clone(&self.manager.chronicler),
            self.manager.clock,
        )?
        .with_store(store);
        if self.emitting {
            subscription =
                subscription.with_emitter(Emitter::new(self.name, self.manager.chronicler, cache_size));
        }
        Ok(PersistentProjector::new(subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicler::InMemoryChronicler;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::epoch;
    use crate::options::OptionsError;
    use crate::projection::test_fixtures::Tally;
    use crate::repository::InMemoryProjectionRepository;

    fn manager() -> (ProjectorManager, InMemoryProjectionRepository) {
        let clock = Arc::new(ManualClock::new(epoch()));
        let repo = InMemoryProjectionRepository::new();
        let manager = ProjectorManager::new(
            Arc::new(InMemoryChronicler::new(clock.clone())),
            Arc::new(repo.clone()),
        )
        .with_clock(clock);
        (manager, repo)
    }

    #[test]
    fn build_requires_a_scope() {
        let (manager, _) = manager();
        let err = manager.query::<Tally>().build().err().expect("no scope");
        assert!(matches!(err, ProjectionError::MissingScope));
    }

    #[test]
    fn build_validates_options() {
        let (manager, _) = manager();
        let err = manager
            .projection::<Tally>("balances")
            .from_all()
            .with_options(ProjectionOptions::default().with_block_size(0))
            .build()
            .err()
            .expect("invalid block size");
        assert!(matches!(err, ProjectionError::Options(OptionsError::Zero("blockSize"))));
    }

    #[test]
    fn emitter_targets_stream_named_after_projection() {
        let (manager, _) = manager();
        let projector = manager
            .emitter::<Tally>("balances")
            .from_categories(["account"])
            .build()
            .expect("build");
        assert_eq!(projector.name(), "balances");
        let emitter = projector.subscription().emitter.as_ref().expect("emitter");
        assert_eq!(emitter.stream_name(), "balances");
    }

    #[tokio::test]
    async fn operator_commands_write_target_status() {
        let (manager, repo) = manager();
        repo.create("balances", ProjectionStatus::Running)
            .await
            .expect("create");

        manager.stop("balances").await.expect("stop");
        assert_eq!(
            manager.status_of("balances").await.expect("status"),
            ProjectionStatus::Stopping
        );
        manager.reset("balances").await.expect("reset");
        assert_eq!(
            manager.status_of("balances").await.expect("status"),
            ProjectionStatus::Resetting
        );
        manager.delete("balances", true).await.expect("delete");
        assert_eq!(
            manager.status_of("balances").await.expect("status"),
            ProjectionStatus::DeletingWithEmittedEvents
        );
    }

    #[tokio::test]
    async fn commands_on_unknown_projection_fail() {
        let (manager, _) = manager();
        let err = manager.stop("ghost").await.expect_err("missing");
        assert!(matches!(err, ProjectionError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn state_of_falls_back_to_default() {
        let (manager, repo) = manager();
        repo.create("balances", ProjectionStatus::Idle)
            .await
            .expect("create");
        let state: Tally = manager.state_of("balances").await.expect("state");
        assert_eq!(state, Tally::default());
        assert_eq!(manager.names().await.expect("names"), vec!["balances"]);
    }
}
