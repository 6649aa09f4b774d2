//! Reactions to the durable status of a persistent projection.
//!
//! Operators never touch a running projector directly: they write a target
//! status to the repository, and the projector picks it up here on its next
//! status check.

use crate::error::ProjectionError;
use crate::projection::Projection;
use crate::status::ProjectionStatus;

use super::Subscription;

/// What the run should do after a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disclosure {
    Continue,
    /// The run ends; the lifecycle action already cleaned up.
    Halt,
}

/// Read the durable status and act on it.
///
/// | Observed | Action |
/// |---|---|
/// | `Running`, `Idle` | continue |
/// | `Stopping` | sync (first check only), close, halt |
/// | `Resetting` | revise; restart when daemonized after the first check |
/// | `Deleting` | discard the record, halt |
/// | `DeletingWithEmittedEvents` | discard the record and emitted stream, halt |
///
/// # Errors
///
/// Propagates repository and chronicler failures from the chosen action.
pub async fn disclose<P: Projection>(
    subscription: &mut Subscription<P>,
) -> Result<Disclosure, ProjectionError> {
    let status = subscription.store_mut()?.load_status().await?;
    let first = std::mem::replace(&mut subscription.first_execution, false);
    subscription.status = status;

    match status {
        ProjectionStatus::Running | ProjectionStatus::Idle => Ok(Disclosure::Continue),
        ProjectionStatus::Stopping => {
            if first {
                synchronise(subscription).await?;
            }
            close(subscription).await?;
            Ok(Disclosure::Halt)
        }
        ProjectionStatus::Resetting => {
            revise(subscription).await?;
            if first {
                Ok(Disclosure::Continue)
            } else if subscription.keep_running {
                restart(subscription).await?;
                Ok(Disclosure::Continue)
            } else {
                subscription.stopped = true;
                Ok(Disclosure::Halt)
            }
        }
        ProjectionStatus::Deleting => {
            discard(subscription, false).await?;
            Ok(Disclosure::Halt)
        }
        ProjectionStatus::DeletingWithEmittedEvents => {
            discard(subscription, true).await?;
            Ok(Disclosure::Halt)
        }
    }
}

/// Take the lock and load the durable state.
///
/// # Errors
///
/// Returns [`ProjectionError::AlreadyRunning`] while another runner holds a
/// live lock.
pub async fn mount<P: Projection>(subscription: &mut Subscription<P>) -> Result<(), ProjectionError> {
    let store = subscription.store_mut()?;
    if !store.exists().await? {
        store.create().await?;
    }
    store.acquire_lock().await?;
    subscription.status = ProjectionStatus::Running;

    synchronise(subscription).await?;
    tracing::info!(
        projection = subscription.name().unwrap_or_default(),
        streams = subscription.tracker.checkpoints().len(),
        "projection running"
    );
    Ok(())
}

/// Replace local checkpoints and state with the persisted ones.
///
/// Streams are discovered first so that persisted cursors land on watched
/// streams.
pub async fn synchronise<P: Projection>(
    subscription: &mut Subscription<P>,
) -> Result<(), ProjectionError> {
    subscription.discover_streams().await?;
    let record = subscription.store_mut()?.load().await?;
    subscription.tracker.sync(&record.checkpoints);
    subscription.restore_state(record.state)?;
    Ok(())
}

/// Persist, release the lock and end the run.
pub async fn close<P: Projection>(subscription: &mut Subscription<P>) -> Result<(), ProjectionError> {
    subscription.persist().await?;
    subscription.store_mut()?.release().await?;
    subscription.status = ProjectionStatus::Idle;
    subscription.stopped = true;
    subscription.closed = true;
    tracing::info!(projection = subscription.name().unwrap_or_default(), "projection closed");
    Ok(())
}

/// Forget every checkpoint and return the state to its initial value.
///
/// The durable record is reset to idle, and an emitter also drops the
/// stream it wrote so a rebuild does not duplicate its output.
pub async fn revise<P: Projection>(subscription: &mut Subscription<P>) -> Result<(), ProjectionError> {
    subscription.tracker.flush();
    subscription.reset_state();
    subscription.counter.reset();

    let initial = subscription.initial_value()?;
    subscription
        .store_mut()?
        .reset(initial, Vec::new(), ProjectionStatus::Idle)
        .await?;
    if let Some(emitter) = subscription.emitter.as_mut() {
        emitter.delete_stream().await?;
    }
    subscription.status = ProjectionStatus::Idle;
    subscription.discover_streams().await?;
    tracing::info!(projection = subscription.name().unwrap_or_default(), "projection reset");
    Ok(())
}

/// Delete the durable record and end the run.
pub async fn discard<P: Projection>(
    subscription: &mut Subscription<P>,
    with_emitted_events: bool,
) -> Result<(), ProjectionError> {
    subscription.store_mut()?.delete().await?;
    if with_emitted_events && let Some(emitter) = subscription.emitter.as_mut() {
        emitter.delete_stream().await?;
    }
    subscription.tracker.flush();
    subscription.reset_state();
    subscription.counter.reset();
    subscription.stopped = true;
    subscription.discarded = true;
    tracing::info!(
        projection = subscription.name().unwrap_or_default(),
        with_emitted_events,
        "projection deleted"
    );
    Ok(())
}

/// Mark running again under a fresh lock after a reset.
pub async fn restart<P: Projection>(subscription: &mut Subscription<P>) -> Result<(), ProjectionError> {
    subscription.store_mut()?.start_again().await?;
    subscription.status = ProjectionStatus::Running;
    Ok(())
}
