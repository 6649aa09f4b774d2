//! The activities query and persistent chains are built from.
//!
//! Query chain:
//!
//! ```text
//! RiseQuery -> LoadStreams -> HandleStreamEvent -> SleepForQuery -> DispatchSignal
//! ```
//!
//! Persistent chain:
//!
//! ```text
//! CycleObserver -> RisePersistent -> LoadStreams -> HandleStreamEvent
//!   -> HandleGap -> PersistOrUpdateLock -> DispatchSignal -> RefreshRemoteStatus
//! ```

use std::sync::Arc;

use tracing::Instrument;

use crate::error::ProjectionError;
use crate::gap::GapOutcome;
use crate::merge::StreamMerge;
use crate::projection::{Projection, ReactionScope};
use crate::status::ProjectionStatus;

use super::lifecycle::{self, Disclosure};
use super::{Activity, ActivityFuture, Next, Subscription};

/// Activities of a query projector, in order.
pub fn query_chain<P: Projection>() -> Vec<Box<dyn Activity<P>>> {
    vec![
        Box::new(RiseQuery),
        Box::new(LoadStreams),
        Box::new(HandleStreamEvent),
        Box::new(SleepForQuery),
        Box::new(DispatchSignal),
    ]
}

/// Activities of a persistent projector, in order.
pub fn persistent_chain<P: Projection>() -> Vec<Box<dyn Activity<P>>> {
    vec![
        Box::new(CycleObserver),
        Box::new(RisePersistent),
        Box::new(LoadStreams),
        Box::new(HandleStreamEvent),
        Box::new(HandleGap),
        Box::new(PersistOrUpdateLock),
        Box::new(DispatchSignal),
        Box::new(RefreshRemoteStatus),
    ]
}

/// Starts a query cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiseQuery;

impl<P: Projection> Activity<P> for RiseQuery {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            subscription.begin_cycle();
            if !subscription.risen {
                subscription.risen = true;
                subscription.status = ProjectionStatus::Running;
            }
            next.run(subscription).await
        })
    }
}

/// Starts a persistent cycle and runs the rest of it inside a debug span.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleObserver;

impl<P: Projection> Activity<P> for CycleObserver {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            subscription.begin_cycle();
            let span = tracing::debug_span!("cycle", projection = subscription.name().unwrap_or_default());
            next.run(subscription).instrument(span).await
        })
    }
}

/// Checks the durable status and mounts the projection on its first cycle.
///
/// Short-circuits the cycle when the status ends the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RisePersistent;

impl<P: Projection> Activity<P> for RisePersistent {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if !subscription.risen {
                let store = subscription.store_mut()?;
                if !store.exists().await? {
                    store.create().await?;
                }
                if lifecycle::disclose(subscription).await? == Disclosure::Halt {
                    return Ok(false);
                }
                lifecycle::mount(subscription).await?;
                subscription.risen = true;
            }
            next.run(subscription).await
        })
    }
}

/// Opens one lazy stream per watched stream, starting after its checkpoint.
///
/// Streams that do not exist yet are skipped until they appear.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStreams;

impl<P: Projection> Activity<P> for LoadStreams {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            subscription.discover_streams().await?;

            let chronicler = Arc::clone(&subscription.chronicler);
            let cursors: Vec<(String, u64)> = subscription
                .tracker
                .to_records()
                .into_iter()
                .map(|c| (c.stream_name, c.position))
                .collect();

            let mut sources = Vec::with_capacity(cursors.len());
            for (stream_name, position) in cursors {
                match chronicler.retrieve_filtered(&stream_name, position + 1).await {
                    Ok(events) => sources.push((stream_name, events)),
                    Err(e) if e.is_stream_not_found() => {
                        tracing::warn!(stream = %stream_name, "stream not found, skipped");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            subscription.merge = Some(StreamMerge::new(sources).await?);
            next.run(subscription).await
        })
    }
}

/// Feeds merged events through the checkpoint tracker into the projection.
///
/// The batch ends early on a pending gap, a stop request, or a persisted
/// block after which the durable status is no longer `Running`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleStreamEvent;

impl<P: Projection> Activity<P> for HandleStreamEvent {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if let Some(merge) = subscription.merge.take() {
                handle_events(subscription, merge).await?;
            }
            next.run(subscription).await
        })
    }
}

async fn handle_events<P: Projection>(
    subscription: &mut Subscription<P>,
    mut merge: StreamMerge,
) -> Result<(), ProjectionError> {
    let emit_stream = subscription
        .emitter
        .as_ref()
        .map(|e| e.stream_name().to_owned());

    while !subscription.is_stopped() {
        let Some(event) = merge.next().await? else {
            break;
        };

        let outcome = subscription
            .tracker
            .bind(&event.stream_name, event.position, event.recorded_at)?;
        if !outcome.is_bound() {
            break;
        }
        if outcome == GapOutcome::Resolved {
            subscription.gap_resolved = true;
        }

        let mut stop = false;
        match event.decode::<P::Event>() {
            Some(domain_event) => {
                let mut scope = ReactionScope::new(&event, emit_stream.as_deref());
                subscription
                    .state
                    .react(domain_event, &mut scope)
                    .map_err(ProjectionError::Reaction)?;
                stop = scope.is_stop_requested();
                let emissions = scope.into_emissions();
                if let Some(emitter) = subscription.emitter.as_mut()
                    && !emissions.is_empty()
                {
                    emitter.write(emissions).await?;
                }
            }
            None => tracing::debug!(
                stream = %event.stream_name,
                position = event.position,
                event_type = %event.event_type,
                "event skipped"
            ),
        }

        subscription.acked = true;
        subscription.counter.increment();

        if subscription.store.is_some() && subscription.counter.is_reached() {
            subscription.persist().await?;
            let status = subscription.store_mut()?.load_status().await?;
            if status != ProjectionStatus::Running {
                break;
            }
        }

        if stop {
            tracing::info!(
                stream = %event.stream_name,
                position = event.position,
                "stop requested by reaction"
            );
            subscription.stopped = true;
        }
    }
    Ok(())
}

/// Idle or gap backoff between query cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepForQuery;

impl<P: Projection> Activity<P> for SleepForQuery {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if subscription.tracker.has_gap() {
                subscription.tracker.sleep().await;
            } else if subscription.keep_running && !subscription.acked {
                subscription.idle.sleep().await;
            }
            next.run(subscription).await
        })
    }
}

/// Persists up to a pending gap, then waits out one retry delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleGap;

impl<P: Projection> Activity<P> for HandleGap {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if subscription.tracker.has_gap() {
                subscription.persist().await?;
                subscription.tracker.sleep().await;
            }
            next.run(subscription).await
        })
    }
}

/// Persists a full block, or just keeps the lock alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistOrUpdateLock;

impl<P: Projection> Activity<P> for PersistOrUpdateLock {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if !subscription.tracker.has_gap() {
                if subscription.counter.is_reset() {
                    if subscription.keep_running && !subscription.acked {
                        subscription.idle.sleep().await;
                    }
                    subscription.store_mut()?.update_lock().await?;
                } else if subscription.counter.is_reached()
                    || (subscription.gap_resolved && !subscription.is_emitting())
                {
                    subscription.persist().await?;
                } else {
                    subscription.store_mut()?.update_lock().await?;
                }
            }
            next.run(subscription).await
        })
    }
}

/// Yields to the runtime and picks up a stop request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSignal;

impl<P: Projection> Activity<P> for DispatchSignal {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if subscription.stop.is_stopped() {
                subscription.stopped = true;
            }
            next.run(subscription).await
        })
    }
}

/// Re-reads the durable status at the end of a cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshRemoteStatus;

impl<P: Projection> Activity<P> for RefreshRemoteStatus {
    fn handle<'a>(&'a self, subscription: &'a mut Subscription<P>, next: Next<'a, P>) -> ActivityFuture<'a> {
        Box::pin(async move {
            if !subscription.stopped && lifecycle::disclose(subscription).await? == Disclosure::Halt {
                subscription.stopped = true;
            }
            next.run(subscription).await
        })
    }
}
