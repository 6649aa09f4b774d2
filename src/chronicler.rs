//! Event store contract consumed by projectors, plus an in-memory store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::event::{ProposedEvent, RecordedEvent};
use crate::merge::EventStream;

/// Error returned by a [`Chronicler`].
#[derive(Debug, thiserror::Error)]
pub enum ChroniclerError {
    /// The stream does not exist. Loaders treat this as "no events yet".
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// Creating a stream that already exists.
    #[error("stream '{0}' already exists")]
    StreamExists(String),

    /// An event could not be encoded or decoded.
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other store failure (connection, I/O, ...).
    #[error("event store failure: {0}")]
    Other(String),
}

impl ChroniclerError {
    /// Returns `true` for a read of a missing stream.
    pub fn is_stream_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_))
    }
}

/// Read/write access to append-only event streams.
///
/// Reads return lazy, position-ordered [`EventStream`]s; nothing requires an
/// implementation to buffer a whole stream.
#[async_trait]
pub trait Chronicler: Send + Sync + fmt::Debug {
    /// Events of `stream_name` with `position >= from_position`.
    ///
    /// # Errors
    ///
    /// Returns [`ChroniclerError::StreamNotFound`] if the stream is missing.
    async fn retrieve_filtered(
        &self,
        stream_name: &str,
        from_position: u64,
    ) -> Result<EventStream, ChroniclerError>;

    /// Every event of `stream_name` from the beginning.
    async fn retrieve_all(&self, stream_name: &str) -> Result<EventStream, ChroniclerError> {
        self.retrieve_filtered(stream_name, 1).await
    }

    /// Names of every existing stream.
    async fn stream_names(&self) -> Result<Vec<String>, ChroniclerError>;

    async fn has_stream(&self, stream_name: &str) -> Result<bool, ChroniclerError>;

    /// Create `stream_name` holding `events`.
    ///
    /// # Errors
    ///
    /// Returns [`ChroniclerError::StreamExists`] if the stream already exists.
    async fn create_stream(
        &self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
    ) -> Result<(), ChroniclerError>;

    /// Append `events` to an existing stream and return the last position written.
    ///
    /// # Errors
    ///
    /// Returns [`ChroniclerError::StreamNotFound`] if the stream is missing.
    async fn append(
        &self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, ChroniclerError>;

    /// Delete a stream and all its events.
    async fn delete_stream(&self, stream_name: &str) -> Result<(), ChroniclerError>;
}

/// [`Chronicler`] keeping streams in memory.
///
/// Clones share the same streams. Positions start at 1 and are assigned on
/// append; [`insert`](InMemoryChronicler::insert) places a pre-positioned
/// event directly, which lets tests leave holes in a stream the way a slow
/// concurrent writer would.
#[derive(Debug, Clone)]
pub struct InMemoryChronicler {
    streams: Arc<RwLock<BTreeMap<String, Vec<RecordedEvent>>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryChronicler {
    /// Empty store stamping appended events with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: Arc::new(RwLock::new(BTreeMap::new())),
            clock,
        }
    }

    /// Place `event` at its own position, creating the stream if needed.
    ///
    /// An event already stored at the same position is replaced.
    pub async fn insert(&self, event: RecordedEvent) {
        let mut streams = self.streams.write().await;
        let events = streams.entry(event.stream_name.clone()).or_default();
        match events.binary_search_by_key(&event.position, |e| e.position) {
            Ok(index) => events[index] = event,
            Err(index) => events.insert(index, event),
        }
    }

    /// Number of events stored in `stream_name`, if it exists.
    pub async fn len(&self, stream_name: &str) -> Option<usize> {
        self.streams.read().await.get(stream_name).map(Vec::len)
    }

    fn stamp(
        &self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
        after: u64,
    ) -> Vec<RecordedEvent> {
        let now = self.clock.now();
        events
            .into_iter()
            .zip(after + 1..)
            .map(|(event, position)| event.record(stream_name, position, now))
            .collect()
    }
}

#[async_trait]
impl Chronicler for InMemoryChronicler {
    async fn retrieve_filtered(
        &self,
        stream_name: &str,
        from_position: u64,
    ) -> Result<EventStream, ChroniclerError> {
        let streams = self.streams.read().await;
        let events = streams
            .get(stream_name)
            .ok_or_else(|| ChroniclerError::StreamNotFound(stream_name.to_owned()))?;
        let selected: Vec<Result<RecordedEvent, ChroniclerError>> = events
            .iter()
            .filter(|e| e.position >= from_position)
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(selected)))
    }

    async fn stream_names(&self) -> Result<Vec<String>, ChroniclerError> {
        Ok(self.streams.read().await.keys().cloned().collect())
    }

    async fn has_stream(&self, stream_name: &str) -> Result<bool, ChroniclerError> {
        Ok(self.streams.read().await.contains_key(stream_name))
    }

    async fn create_stream(
        &self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
    ) -> Result<(), ChroniclerError> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(stream_name) {
            return Err(ChroniclerError::StreamExists(stream_name.to_owned()));
        }
        let recorded = self.stamp(stream_name, events, 0);
        streams.insert(stream_name.to_owned(), recorded);
        tracing::debug!(stream = %stream_name, "stream created");
        Ok(())
    }

    async fn append(
        &self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, ChroniclerError> {
        let mut streams = self.streams.write().await;
        let existing = streams
            .get(stream_name)
            .ok_or_else(|| ChroniclerError::StreamNotFound(stream_name.to_owned()))?;
        let last = existing.last().map_or(0, |e| e.position);
        let recorded = self.stamp(stream_name, events, last);
        let new_last = recorded.last().map_or(last, |e| e.position);
        if let Some(stream) = streams.get_mut(stream_name) {
            stream.extend(recorded);
        }
        Ok(new_last)
    }

    async fn delete_stream(&self, stream_name: &str) -> Result<(), ChroniclerError> {
        match self.streams.write().await.remove(stream_name) {
            Some(_) => {
                tracing::debug!(stream = %stream_name, "stream deleted");
                Ok(())
            }
            None => Err(ChroniclerError::StreamNotFound(stream_name.to_owned())),
        }
    }
}
