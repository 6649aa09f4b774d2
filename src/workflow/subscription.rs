use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::chronicler::{Chronicler, ChroniclerError};
use crate::clock::Clock;
use crate::counter::{EventCounter, IdleThrottle};
use crate::emitter::Emitter;
use crate::error::ProjectionError;
use crate::gap::{CheckpointTracker, GapDetector};
use crate::merge::StreamMerge;
use crate::options::{OptionsError, ProjectionOptions};
use crate::projection::Projection;
use crate::repository::ProjectionStore;
use crate::status::ProjectionStatus;

/// Which streams a projector reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamScope {
    /// A fixed list of stream names.
    Streams(Vec<String>),
    /// Every stream whose name starts with `"{category}-"` for one of the
    /// categories, re-discovered each cycle.
    Categories(Vec<String>),
    /// Every stream in the store, re-discovered each cycle.
    All,
}

impl StreamScope {
    /// Resolve the scope to concrete stream names.
    ///
    /// `exclude` removes one name from dynamic scopes; emitters use it so
    /// they never read their own output.
    pub async fn resolve(
        &self,
        chronicler: &dyn Chronicler,
        exclude: Option<&str>,
    ) -> Result<Vec<String>, ChroniclerError> {
        let names = match self {
            Self::Streams(names) => return Ok(names.clone()),
            Self::Categories(categories) => {
                let prefixes: Vec<String> = categories.iter().map(|c| format!("{c}-")).collect();
                chronicler
                    .stream_names()
                    .await?
                    .into_iter()
                    .filter(|name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
                    .collect::<Vec<_>>()
            }
            Self::All => chronicler.stream_names().await?,
        };
        Ok(names
            .into_iter()
            .filter(|name| Some(name.as_str()) != exclude)
            .collect())
    }
}

/// Cooperative stop request shared between a projector and its handles.
///
/// Clones observe the same flag. The flag is checked at cycle boundaries and
/// between events, never in the middle of a reaction.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the running projector to stop after the current event.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Raise the stop flag on Ctrl-C until the returned task is aborted.
    pub(crate) fn listen_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let tx = Arc::clone(&self.tx);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received, stopping projection");
                    tx.send_replace(true);
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for interrupt"),
            }
        })
    }
}

/// Mutable context shared by every activity of a run.
pub struct Subscription<P: Projection> {
    pub(crate) options: ProjectionOptions,
    pub(crate) scope: StreamScope,
    pub(crate) chronicler: Arc<dyn Chronicler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tracker: CheckpointTracker,
    pub(crate) initial: P,
    pub(crate) state: P,
    /// Local mirror of the durable status.
    pub(crate) status: ProjectionStatus,
    pub(crate) counter: EventCounter,
    pub(crate) idle: IdleThrottle,
    pub(crate) merge: Option<StreamMerge>,
    pub(crate) stop: StopHandle,
    pub(crate) store: Option<ProjectionStore>,
    pub(crate) emitter: Option<Emitter>,
    /// At least one event was handled this cycle.
    pub(crate) acked: bool,
    /// A gap was confirmed and recorded this cycle.
    pub(crate) gap_resolved: bool,
    pub(crate) first_execution: bool,
    pub(crate) risen: bool,
    pub(crate) keep_running: bool,
    /// The run ends after the current cycle.
    pub(crate) stopped: bool,
    pub(crate) closed: bool,
    pub(crate) discarded: bool,
}

impl<P: Projection> Subscription<P> {
    /// # Errors
    ///
    /// Returns [`OptionsError`] if the detection window cannot be parsed.
    pub fn new(
        options: ProjectionOptions,
        scope: StreamScope,
        initial: P,
        chronicler: Arc<dyn Chronicler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OptionsError> {
        let detector = GapDetector::new(options.retry_delays(), options.detection_window()?);
        Ok(Self {
            tracker: CheckpointTracker::new(detector, Arc::clone(&clock)),
            counter: EventCounter::new(options.block_size),
            idle: IdleThrottle::from_option(&options.sleep)?,
            state: initial.clone(),
            initial,
            status: ProjectionStatus::Idle,
            merge: None,
            stop: StopHandle::new(),
            store: None,
            emitter: None,
            acked: false,
            gap_resolved: false,
            first_execution: true,
            risen: false,
            keep_running: false,
            stopped: false,
            closed: false,
            discarded: false,
            options,
            scope,
            chronicler,
            clock,
        })
    }

    pub(crate) fn with_store(mut self, store: ProjectionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Reset per-run flags before the first cycle.
    pub(crate) fn begin_run(&mut self, keep_running: bool) {
        self.keep_running = keep_running;
        self.first_execution = true;
        self.risen = false;
        self.stopped = false;
        self.closed = false;
        self.discarded = false;
    }

    /// Reset per-cycle flags.
    pub(crate) fn begin_cycle(&mut self) {
        self.acked = false;
        self.gap_resolved = false;
    }

    /// Current in-memory state.
    pub fn state(&self) -> &P {
        &self.state
    }

    /// Checkpoints and gap bookkeeping.
    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    pub fn status(&self) -> ProjectionStatus {
        self.status
    }

    pub fn options(&self) -> &ProjectionOptions {
        &self.options
    }

    /// Projection name, for persistent projectors.
    pub fn name(&self) -> Option<&str> {
        self.store.as_ref().map(ProjectionStore::name)
    }

    pub(crate) fn is_emitting(&self) -> bool {
        self.emitter.is_some()
    }

    /// Returns `true` once the run should end, by request or by lifecycle.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped || self.stop.is_stopped()
    }

    pub(crate) fn store_mut(&mut self) -> Result<&mut ProjectionStore, ProjectionError> {
        self.store.as_mut().ok_or(ProjectionError::NotPersistent)
    }

    pub(crate) fn reset_state(&mut self) {
        self.state = self.initial.clone();
    }

    pub(crate) fn initial_value(&self) -> Result<Value, ProjectionError> {
        Ok(serde_json::to_value(&self.initial)?)
    }

    /// Replace the state with a persisted value. `null` keeps the current state.
    pub(crate) fn restore_state(&mut self, value: Value) -> Result<(), ProjectionError> {
        if !value.is_null() {
            self.state = serde_json::from_value(value)?;
        }
        Ok(())
    }

    /// Resolve the stream scope and start watching any new stream.
    pub(crate) async fn discover_streams(&mut self) -> Result<(), ProjectionError> {
        let chronicler = Arc::clone(&self.chronicler);
        let exclude = self.emitter.as_ref().map(|e| e.stream_name().to_owned());
        let names = self.scope.resolve(chronicler.as_ref(), exclude.as_deref()).await?;
        self.tracker.discover(names);
        Ok(())
    }

    /// Store state and checkpoints, then restart the batch count.
    pub(crate) async fn persist(&mut self) -> Result<(), ProjectionError> {
        let state = serde_json::to_value(&self.state)?;
        let checkpoints = self.tracker.to_records();
        self.store_mut()?.persist(state, checkpoints).await?;
        self.counter.reset();
        Ok(())
    }
}

impl<P: Projection + std::fmt::Debug> std::fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name())
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicler::InMemoryChronicler;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::epoch;
    use crate::projection::test_fixtures::Tally;

    async fn chronicler_with(names: &[&str]) -> InMemoryChronicler {
        let chronicler = InMemoryChronicler::new(Arc::new(ManualClock::new(epoch())));
        for name in names {
            chronicler.create_stream(name, vec![]).await.expect("create");
        }
        chronicler
    }

    #[tokio::test]
    async fn fixed_scope_ignores_store_content() {
        let chronicler = chronicler_with(&["account-1"]).await;
        let scope = StreamScope::Streams(vec!["missing".to_string()]);
        assert_eq!(
            scope.resolve(&chronicler, None).await.expect("resolve"),
            vec!["missing"]
        );
    }

    #[tokio::test]
    async fn category_scope_matches_prefix() {
        let chronicler = chronicler_with(&["account-1", "account-2", "accounting", "order-1"]).await;
        let scope = StreamScope::Categories(vec!["account".to_string()]);
        assert_eq!(
            scope.resolve(&chronicler, None).await.expect("resolve"),
            vec!["account-1", "account-2"]
        );
    }

    #[tokio::test]
    async fn all_scope_excludes_own_stream() {
        let chronicler = chronicler_with(&["account-1", "balances"]).await;
        assert_eq!(
            StreamScope::All
                .resolve(&chronicler, Some("balances"))
                .await
                .expect("resolve"),
            vec!["account-1"]
        );
    }

    #[test]
    fn stop_handle_clones_share_flag() {
        let handle = StopHandle::new();
        let other = handle.clone();
        other.stop();
        assert!(handle.is_stopped());
        handle.clear();
        assert!(!other.is_stopped());
    }

    #[test]
    fn restore_state_keeps_current_on_null() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let mut sub = Subscription::new(
            ProjectionOptions::default(),
            StreamScope::All,
            Tally::default(),
            Arc::new(InMemoryChronicler::new(clock.clone())),
            clock,
        )
        .expect("valid options");
        sub.state.total = 9;

        sub.restore_state(Value::Null).expect("null is accepted");
        assert_eq!(sub.state.total, 9);

        sub.restore_state(serde_json::json!({ "total": 4, "seen": [] }))
            .expect("restore");
        assert_eq!(sub.state.total, 4);

        sub.reset_state();
        assert_eq!(sub.state, Tally::default());
    }

    #[test]
    fn persisting_without_store_is_rejected() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let mut sub = Subscription::new(
            ProjectionOptions::default(),
            StreamScope::All,
            Tally::default(),
            Arc::new(InMemoryChronicler::new(clock.clone())),
            clock,
        )
        .expect("valid options");
        assert!(matches!(sub.store_mut(), Err(ProjectionError::NotPersistent)));
    }
}
