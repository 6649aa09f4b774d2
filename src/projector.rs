//! Run loops for query and persistent projectors.
//!
//! A projector owns one [`Subscription`] and one [`Workflow`] and repeats
//! the workflow's cycle until the run is stopped. Build projectors through
//! [`ProjectorManager`](crate::ProjectorManager).

use tracing::Instrument;

use crate::checkpoint::CheckpointRecord;
use crate::error::ProjectionError;
use crate::projection::Projection;
use crate::status::ProjectionStatus;
use crate::workflow::{StopHandle, Subscription, Workflow, activities, lifecycle};

/// Repeat cycles until the run ends.
///
/// A one-shot run (`keep_running == false`) still keeps cycling while a gap
/// is pending, so the retry schedule can play out before it returns.
async fn run_cycles<P: Projection>(
    workflow: &Workflow<P>,
    subscription: &mut Subscription<P>,
    keep_running: bool,
) -> Result<(), ProjectionError> {
    subscription.begin_run(keep_running);
    let listener = subscription
        .options
        .signal
        .then(|| subscription.stop.listen_ctrl_c());

    let result = cycle_until_stopped(workflow, subscription).await;

    if let Some(listener) = listener {
        listener.abort();
    }
    subscription.stop.clear();
    result
}

async fn cycle_until_stopped<P: Projection>(
    workflow: &Workflow<P>,
    subscription: &mut Subscription<P>,
) -> Result<(), ProjectionError> {
    loop {
        workflow.process(subscription).await?;
        if subscription.is_stopped() {
            return Ok(());
        }
        if !subscription.keep_running && !subscription.tracker.has_gap() {
            return Ok(());
        }
    }
}

/// Projector keeping its state in memory only.
///
/// Checkpoints survive between runs of the same value, so a second
/// [`run`](Self::run) picks up where the first stopped.
pub struct QueryProjector<P: Projection> {
    subscription: Subscription<P>,
    workflow: Workflow<P>,
}

impl<P: Projection> QueryProjector<P> {
    pub(crate) fn new(subscription: Subscription<P>) -> Self {
        Self {
            subscription,
            workflow: Workflow::new(activities::query_chain()),
        }
    }

    /// Fold events until caught up, or until stopped when `keep_running`.
    ///
    /// # Errors
    ///
    /// Returns the first chronicler, checkpoint or reaction error.
    pub async fn run(&mut self, keep_running: bool) -> Result<(), ProjectionError> {
        let span = tracing::info_span!("query", keep_running);
        let result = run_cycles(&self.workflow, &mut self.subscription, keep_running)
            .instrument(span)
            .await;
        self.subscription.status = ProjectionStatus::Idle;
        result
    }

    /// Current in-memory state.
    pub fn state(&self) -> &P {
        self.subscription.state()
    }

    /// Current cursor of every watched stream.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.subscription.tracker().to_records()
    }

    /// Forget checkpoints and return to the initial state.
    pub fn reset(&mut self) {
        self.subscription.tracker.flush();
        self.subscription.reset_state();
        self.subscription.counter.reset();
    }

    /// Handle for stopping a running `run` from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.subscription.stop.clone()
    }

    /// Run context, for inspection.
    pub fn subscription(&self) -> &Subscription<P> {
        &self.subscription
    }
}

/// Projector persisting state and checkpoints under an optimistic lock.
///
/// Emitting projectors are persistent projectors with an emitter attached.
pub struct PersistentProjector<P: Projection> {
    subscription: Subscription<P>,
    workflow: Workflow<P>,
}

impl<P: Projection> PersistentProjector<P> {
    pub(crate) fn new(subscription: Subscription<P>) -> Self {
        Self {
            subscription,
            workflow: Workflow::new(activities::persistent_chain()),
        }
    }

    /// Run until caught up, or until stopped when `keep_running`.
    ///
    /// A run that ends normally persists and releases the lock. Any error
    /// other than a lock conflict releases the lock before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::AlreadyRunning`] while another runner holds
    /// the lock, or the first repository, chronicler or reaction error.
    pub async fn run(&mut self, keep_running: bool) -> Result<(), ProjectionError> {
        let span = tracing::info_span!(
            "projection",
            projection = self.subscription.name().unwrap_or_default(),
            keep_running
        );
        self.run_locked(keep_running).instrument(span).await
    }

    async fn run_locked(&mut self, keep_running: bool) -> Result<(), ProjectionError> {
        let result = match run_cycles(&self.workflow, &mut self.subscription, keep_running).await {
            Ok(()) => {
                let sub = &mut self.subscription;
                if sub.risen && !sub.closed && !sub.discarded {
                    lifecycle::close(sub).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Err(e) if !e.is_already_running() => {
                self.release_after_failure(&e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn release_after_failure(&mut self, cause: &ProjectionError) {
        let Some(store) = self.subscription.store.as_mut() else {
            return;
        };
        if store.lock().current().is_none() {
            return;
        }
        tracing::warn!(projection = %store.name(), error = %cause, "run failed, releasing lock");
        if let Err(e) = store.release().await {
            tracing::error!(projection = %store.name(), error = %e, "failed to release lock");
        }
        self.subscription.status = ProjectionStatus::Idle;
    }

    /// Projection name.
    pub fn name(&self) -> &str {
        self.subscription.name().unwrap_or_default()
    }

    /// Current in-memory state.
    pub fn state(&self) -> &P {
        self.subscription.state()
    }

    /// Current cursor of every watched stream.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.subscription.tracker().to_records()
    }

    /// Handle for stopping a running `run` from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.subscription.stop.clone()
    }

    /// Run context, for inspection.
    pub fn subscription(&self) -> &Subscription<P> {
        &self.subscription
    }
}
