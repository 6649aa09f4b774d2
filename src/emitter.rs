//! Appending events produced by reactions.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::chronicler::{Chronicler, ChroniclerError};
use crate::event::ProposedEvent;
use crate::projection::Emission;

/// Bounded memory of stream names known to exist.
///
/// Saves a `has_stream` round trip per emission. The oldest name is evicted
/// once `capacity` names are held.
#[derive(Debug, Clone)]
pub struct StreamCache {
    capacity: usize,
    names: VecDeque<String>,
}

impl StreamCache {
    /// Cache remembering at most `capacity` stream names.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            names: VecDeque::with_capacity(capacity),
        }
    }

    /// Remember `stream_name` as existing, evicting the oldest entry when full.
    pub fn push(&mut self, stream_name: &str) {
        if self.has(stream_name) {
            return;
        }
        if self.names.len() == self.capacity {
            self.names.pop_front();
        }
        self.names.push_back(stream_name.to_owned());
    }

    /// Returns `true` if `stream_name` is known to exist.
    pub fn has(&self, stream_name: &str) -> bool {
        self.names.iter().any(|n| n == stream_name)
    }

    /// Forget every remembered stream.
    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Writes emissions of one emitting projection to the chronicler.
#[derive(Debug, Clone)]
pub struct Emitter {
    stream_name: String,
    chronicler: Arc<dyn Chronicler>,
    cache: StreamCache,
}

impl Emitter {
    /// Emitter writing to `stream_name` and remembering up to `cache_size`
    /// streams it has seen.
    pub fn new(stream_name: impl Into<String>, chronicler: Arc<dyn Chronicler>, cache_size: usize) -> Self {
        Self {
            stream_name: stream_name.into(),
            chronicler,
            cache: StreamCache::new(cache_size),
        }
    }

    /// Stream that [`ReactionScope::emit`](crate::ReactionScope::emit) targets.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Append `emissions`, preserving their order.
    ///
    /// Consecutive emissions to the same stream are written in one call.
    /// Missing streams are created on first write.
    ///
    /// # Errors
    ///
    /// Returns the first chronicler failure; later emissions are not written.
    pub async fn write(&mut self, emissions: Vec<Emission>) -> Result<(), ChroniclerError> {
        let mut batch: Vec<ProposedEvent> = Vec::new();
        let mut target: Option<String> = None;

        for emission in emissions {
            if target.as_deref() != Some(emission.stream_name.as_str()) {
                if let Some(stream) = target.take() {
                    self.write_batch(&stream, std::mem::take(&mut batch)).await?;
                }
                target = Some(emission.stream_name);
            }
            batch.push(emission.event);
        }
        if let Some(stream) = target {
            self.write_batch(&stream, batch).await?;
        }
        Ok(())
    }

    async fn write_batch(
        &mut self,
        stream_name: &str,
        events: Vec<ProposedEvent>,
    ) -> Result<(), ChroniclerError> {
        let count = events.len();
        if self.cache.has(stream_name) || self.chronicler.has_stream(stream_name).await? {
            self.chronicler.append(stream_name, events).await?;
        } else {
            self.chronicler.create_stream(stream_name, events).await?;
        }
        self.cache.push(stream_name);
        tracing::debug!(stream = %stream_name, count, "events emitted");
        Ok(())
    }

    /// Delete the projection's own stream, if it exists.
    pub async fn delete_stream(&mut self) -> Result<(), ChroniclerError> {
        self.cache.clear();
        match self.chronicler.delete_stream(&self.stream_name).await {
            Ok(()) => {
                tracing::info!(stream = %self.stream_name, "emitted stream deleted");
                Ok(())
            }
            Err(e) if e.is_stream_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::chronicler::InMemoryChronicler;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::{AccountEvent, epoch};

    fn emission(stream: &str, amount: i64) -> Emission {
        Emission {
            stream_name: stream.to_string(),
            event: ProposedEvent::from_domain(&AccountEvent::Deposited { amount }).expect("encode"),
        }
    }

    #[test]
    fn cache_evicts_oldest() {
        let mut cache = StreamCache::new(2);
        cache.push("a");
        cache.push("b");
        cache.push("a");
        assert_eq!(cache.len(), 2);
        cache.push("c");
        assert!(!cache.has("a"));
        assert!(cache.has("b") && cache.has("c"));
    }

    #[tokio::test]
    async fn creates_then_appends() {
        let chronicler = InMemoryChronicler::new(Arc::new(ManualClock::new(epoch())));
        let mut emitter = Emitter::new("balances", Arc::new(chronicler.clone()), 10);

        emitter
            .write(vec![emission("balances", 1), emission("balances", 2), emission("audit", 3)])
            .await
            .expect("first write");
        emitter
            .write(vec![emission("balances", 4)])
            .await
            .expect("second write");

        assert_eq!(chronicler.len("balances").await, Some(3));
        assert_eq!(chronicler.len("audit").await, Some(1));

        let positions: Vec<u64> = chronicler
            .retrieve_all("balances")
            .await
            .expect("stream exists")
            .map(|e| e.expect("event").position)
            .collect()
            .await;
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn appends_to_stream_created_elsewhere() {
        let chronicler = InMemoryChronicler::new(Arc::new(ManualClock::new(epoch())));
        chronicler
            .create_stream("audit", vec![])
            .await
            .expect("create");
        let mut emitter = Emitter::new("balances", Arc::new(chronicler.clone()), 1);

        emitter.write(vec![emission("audit", 1)]).await.expect("write");
        assert_eq!(chronicler.len("audit").await, Some(1));
    }

    #[tokio::test]
    async fn delete_stream_is_idempotent() {
        let chronicler = InMemoryChronicler::new(Arc::new(ManualClock::new(epoch())));
        let mut emitter = Emitter::new("balances", Arc::new(chronicler.clone()), 10);
        emitter.write(vec![emission("balances", 1)]).await.expect("write");

        emitter.delete_stream().await.expect("delete");
        emitter.delete_stream().await.expect("second delete is a no-op");
        assert_eq!(chronicler.len("balances").await, None);

        // The cache was cleared, so the stream is recreated.
        emitter.write(vec![emission("balances", 2)]).await.expect("write");
        assert_eq!(chronicler.len("balances").await, Some(1));
    }
}
