//! User-facing projection contract.
//!
//! A projection is a plain state type folded over decoded domain events.
//! Events reach [`Projection::react`] already decoded into the projection's
//! adjacently tagged event enum, so dispatch happens through a `match` on
//! variants rather than on type-name strings.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ReactionError;
use crate::event::{ProposedEvent, RecordedEvent};

/// A read model built by folding events through [`react`](Projection::react).
///
/// # Contract
///
/// - `react` must be deterministic: replaying the same events from the
///   initial state must produce the same state.
/// - Events whose type is unknown to [`Event`](Projection::Event) never
///   reach `react`; the cursor still moves past them.
/// - The state is persisted as JSON, so it must round-trip through serde.
///
/// # Examples
///
/// ```
/// use eventfold_projector::{Projection, ReactionError, ReactionScope};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum AccountEvent {
///     Deposited { amount: i64 },
///     Withdrawn { amount: i64 },
/// }
///
/// #[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// struct Balance {
///     total: i64,
/// }
///
/// impl Projection for Balance {
///     type Event = AccountEvent;
///
///     fn react(
///         &mut self,
///         event: AccountEvent,
///         _scope: &mut ReactionScope<'_>,
///     ) -> Result<(), ReactionError> {
///         match event {
///             AccountEvent::Deposited { amount } => self.total += amount,
///             AccountEvent::Withdrawn { amount } => self.total -= amount,
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Domain events this projection understands, adjacently tagged
    /// (`#[serde(tag = "type", content = "data")]`).
    type Event: DeserializeOwned + Send;

    /// Fold one event into the state.
    ///
    /// # Errors
    ///
    /// Any error aborts the run: the lock is released and the error is
    /// returned to the caller as [`ProjectionError::Reaction`](crate::ProjectionError::Reaction).
    fn react(
        &mut self,
        event: Self::Event,
        scope: &mut ReactionScope<'_>,
    ) -> Result<(), ReactionError>;
}

/// Error returned by [`ReactionScope::emit`] and [`ReactionScope::link_to`].
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The projection was not built as an emitter.
    #[error("projection does not emit events")]
    NotEmitting,

    #[error("failed to encode emitted event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An event produced by a reaction, waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub stream_name: String,
    pub event: ProposedEvent,
}

/// Context handed to [`Projection::react`] for one event.
///
/// Emitted events are buffered here and appended once the reaction returns,
/// so a failing reaction never leaves half of its output in the store.
#[derive(Debug)]
pub struct ReactionScope<'a> {
    event: &'a RecordedEvent,
    emit_stream: Option<&'a str>,
    emissions: Vec<Emission>,
    stop: bool,
}

impl<'a> ReactionScope<'a> {
    pub(crate) fn new(event: &'a RecordedEvent, emit_stream: Option<&'a str>) -> Self {
        Self {
            event,
            emit_stream,
            emissions: Vec::new(),
            stop: false,
        }
    }

    /// Stream the event was read from.
    pub fn stream_name(&self) -> &str {
        &self.event.stream_name
    }

    pub fn position(&self) -> u64 {
        self.event.position
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.event.recorded_at
    }

    /// The raw recorded event, including its metadata.
    pub fn event(&self) -> &RecordedEvent {
        self.event
    }

    /// End the run once this event is handled.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop
    }

    /// Append `event` to the stream named after the projection.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::NotEmitting`] unless the projection was built as
    /// an emitter, or [`EmitError::Encode`] if the event cannot be encoded.
    pub fn emit<E: Serialize>(&mut self, event: &E) -> Result<(), EmitError> {
        let stream = self.emit_stream.ok_or(EmitError::NotEmitting)?;
        self.push(stream.to_owned(), event)
    }

    /// Append `event` to an arbitrary stream, creating it if needed.
    ///
    /// # Errors
    ///
    /// Same as [`emit`](Self::emit).
    pub fn link_to<E: Serialize>(&mut self, stream_name: &str, event: &E) -> Result<(), EmitError> {
        if self.emit_stream.is_none() {
            return Err(EmitError::NotEmitting);
        }
        self.push(stream_name.to_owned(), event)
    }

    fn push<E: Serialize>(&mut self, stream_name: String, event: &E) -> Result<(), EmitError> {
        let event = ProposedEvent::from_domain(event)?;
        self.emissions.push(Emission { stream_name, event });
        Ok(())
    }

    pub(crate) fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::{AccountEvent, at};

    fn recorded() -> RecordedEvent {
        RecordedEvent::new(
            "account-1",
            7,
            "Deposited",
            serde_json::json!({ "amount": 5 }),
            at(3),
        )
    }

    #[test]
    fn exposes_event_coordinates() {
        let event = recorded();
        let scope = ReactionScope::new(&event, None);
        assert_eq!(scope.stream_name(), "account-1");
        assert_eq!(scope.position(), 7);
        assert_eq!(scope.recorded_at(), at(3));
        assert_eq!(scope.event().event_type, "Deposited");
    }

    #[test]
    fn emit_requires_emitter() {
        let event = recorded();
        let mut scope = ReactionScope::new(&event, None);
        let err = scope.emit(&AccountEvent::Opened).expect_err("not an emitter");
        assert!(matches!(err, EmitError::NotEmitting));
        assert!(matches!(
            scope.link_to("audit", &AccountEvent::Opened),
            Err(EmitError::NotEmitting)
        ));
    }

    #[test]
    fn emissions_are_buffered_in_order() {
        let event = recorded();
        let mut scope = ReactionScope::new(&event, Some("balances"));
        scope
            .emit(&AccountEvent::Deposited { amount: 5 })
            .expect("emit");
        scope
            .link_to("audit", &AccountEvent::Opened)
            .expect("link");
        scope.stop();

        assert!(scope.is_stop_requested());
        let emissions = scope.into_emissions();
        assert_eq!(emissions.len(), 2);
        assert_eq!(emissions[0].stream_name, "balances");
        assert_eq!(emissions[0].event.event_type, "Deposited");
        assert_eq!(emissions[1].stream_name, "audit");
    }

    #[test]
    fn reaction_errors_convert_with_question_mark() {
        fn react(scope: &mut ReactionScope<'_>) -> Result<(), ReactionError> {
            scope.emit(&AccountEvent::Opened)?;
            Ok(())
        }
        let event = recorded();
        let mut scope = ReactionScope::new(&event, None);
        let err = react(&mut scope).expect_err("should fail");
        assert_eq!(err.to_string(), "projection does not emit events");
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::{Projection, ReactionScope};
    use crate::error::ReactionError;
    use crate::event::test_fixtures::AccountEvent;

    #[derive(Debug, thiserror::Error)]
    #[error("insufficient funds")]
    pub(crate) struct InsufficientFunds;

    /// Running balance that remembers every `(stream, position)` it folded.
    ///
    /// A zero deposit asks the run to stop; overdrawing fails the reaction.
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Tally {
        pub total: i64,
        pub seen: Vec<(String, u64)>,
    }

    impl Projection for Tally {
        type Event = AccountEvent;

        fn react(
            &mut self,
            event: AccountEvent,
            scope: &mut ReactionScope<'_>,
        ) -> Result<(), ReactionError> {
            self.seen
                .push((scope.stream_name().to_owned(), scope.position()));
            match event {
                AccountEvent::Opened => {}
                AccountEvent::Deposited { amount: 0 } => scope.stop(),
                AccountEvent::Deposited { amount } => self.total += amount,
                AccountEvent::Withdrawn { amount } if amount > self.total => {
                    return Err(Box::new(InsufficientFunds));
                }
                AccountEvent::Withdrawn { amount } => self.total -= amount,
            }
            Ok(())
        }
    }

    /// Emitter that re-emits every deposit to its own stream.
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Echo {
        pub emitted: u64,
    }

    impl Projection for Echo {
        type Event = AccountEvent;

        fn react(
            &mut self,
            event: AccountEvent,
            scope: &mut ReactionScope<'_>,
        ) -> Result<(), ReactionError> {
            if let AccountEvent::Deposited { .. } = event {
                scope.emit(&event)?;
                self.emitted += 1;
            }
            Ok(())
        }
    }
}
