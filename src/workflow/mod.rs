//! Activity pipeline driving one processing cycle.
//!
//! A cycle is a chain of [`Activity`] values walked front to back. Each
//! activity receives the shared [`Subscription`] and a [`Next`] continuation
//! for the rest of the chain, so the first activity wraps every later one,
//! the same shape as request middleware. Returning `Ok(false)` without
//! calling `next` short-circuits the cycle.
//!
//! Query and persistent projectors differ only in the chain they build; see
//! [`activities`].

pub mod activities;
pub mod lifecycle;
mod subscription;

pub use subscription::{StopHandle, StreamScope, Subscription};

use std::future::Future;
use std::pin::Pin;

use crate::error::ProjectionError;
use crate::projection::Projection;

/// Boxed future returned by activities.
pub type ActivityFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, ProjectionError>> + Send + 'a>>;

/// One step of a processing cycle.
pub trait Activity<P: Projection>: Send + Sync {
    /// Run this step, calling `next.run(subscription)` to continue the chain.
    fn handle<'a>(
        &'a self,
        subscription: &'a mut Subscription<P>,
        next: Next<'a, P>,
    ) -> ActivityFuture<'a>;
}

/// Continuation over the activities after the current one.
pub struct Next<'a, P: Projection> {
    rest: &'a [Box<dyn Activity<P>>],
}

impl<'a, P: Projection> Next<'a, P> {
    /// Run the remaining activities.
    ///
    /// The subscription may be reborrowed for a shorter lifetime, so an
    /// activity can keep using it after the rest of the chain returns.
    pub fn run<'b>(self, subscription: &'b mut Subscription<P>) -> ActivityFuture<'b>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((head, tail)) => head.handle(subscription, Next { rest: tail }),
            None => Box::pin(async { Ok(true) }),
        }
    }
}

/// An ordered chain of activities.
pub struct Workflow<P: Projection> {
    activities: Vec<Box<dyn Activity<P>>>,
}

impl<P: Projection> Workflow<P> {
    pub fn new(activities: Vec<Box<dyn Activity<P>>>) -> Self {
        Self { activities }
    }

    /// Run one cycle.
    ///
    /// Returns `Ok(true)` when every activity passed control on, `Ok(false)`
    /// when one of them short-circuited.
    pub async fn process(&self, subscription: &mut Subscription<P>) -> Result<bool, ProjectionError> {
        Next {
            rest: &self.activities,
        }
        .run(subscription)
        .await
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl<P: Projection> std::fmt::Debug for Workflow<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("activities", &self.activities.len())
            .finish()
    }
}
