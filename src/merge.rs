//! Time-ordered merge of several per-stream event sequences.

use std::fmt;
use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};

use crate::chronicler::ChroniclerError;
use crate::event::RecordedEvent;

/// Lazy, forward-only sequence of events read from one stream.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<RecordedEvent, ChroniclerError>> + Send + 'static>>;

struct Source {
    name: String,
    stream: EventStream,
    /// Lookahead item and the pull sequence number it was read with.
    head: Option<(u64, RecordedEvent)>,
}

/// Merges N named event streams into one sequence ordered by `recorded_at`.
///
/// Every source is expected to be ordered by its own position already. Events
/// with equal timestamps come out in the order they were pulled from their
/// sources, which for the initial items is the order the sources were given.
/// Only one lookahead item per source is held, so memory is bounded by the
/// number of sources, not their length.
///
/// Once exhausted the merge cannot be restarted; build a new one to read
/// again. [`consumed`](StreamMerge::consumed) is the terminal summary.
pub struct StreamMerge {
    sources: Vec<Source>,
    current: Option<usize>,
    pulls: u64,
    consumed: usize,
}

impl fmt::Debug for StreamMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMerge")
            .field("sources", &self.sources.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("current", &self.current_stream_name())
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl StreamMerge {
    /// Prime every source with its first item and select the earliest one.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by a source while priming.
    pub async fn new(streams: Vec<(String, EventStream)>) -> Result<Self, ChroniclerError> {
        let mut merge = Self {
            sources: Vec::with_capacity(streams.len()),
            current: None,
            pulls: 0,
            consumed: 0,
        };
        for (name, stream) in streams {
            merge.sources.push(Source {
                name,
                stream,
                head: None,
            });
            let index = merge.sources.len() - 1;
            merge.pull(index).await?;
        }
        merge.select();
        Ok(merge)
    }

    /// A merge over no sources.
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
            current: None,
            pulls: 0,
            consumed: 0,
        }
    }

    async fn pull(&mut self, index: usize) -> Result<(), ChroniclerError> {
        let source = &mut self.sources[index];
        source.head = match source.stream.next().await {
            Some(item) => {
                let seq = self.pulls;
                self.pulls += 1;
                Some((seq, item?))
            }
            None => None,
        };
        Ok(())
    }

    fn select(&mut self) {
        self.current = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(index, source)| {
                source
                    .head
                    .as_ref()
                    .map(|(seq, event)| ((event.recorded_at, *seq), index))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, index)| index);
    }

    /// The earliest pending event, or `None` once every source is exhausted.
    pub fn current(&self) -> Option<&RecordedEvent> {
        let index = self.current?;
        self.sources[index].head.as_ref().map(|(_, event)| event)
    }

    /// Name of the stream the current event belongs to.
    pub fn current_stream_name(&self) -> Option<&str> {
        self.current.map(|index| self.sources[index].name.as_str())
    }

    /// Store position of the current event.
    pub fn current_key(&self) -> Option<u64> {
        self.current().map(|event| event.position)
    }

    /// Consume the current event and refill its source.
    ///
    /// Returns `Ok(None)` once every source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the error yielded by the refilled source. The consumed event
    /// is lost in that case; callers re-read from their checkpoint.
    pub async fn next(&mut self) -> Result<Option<RecordedEvent>, ChroniclerError> {
        let Some(index) = self.current else {
            return Ok(None);
        };
        let event = self.sources[index].head.take().map(|(_, event)| event);
        self.consumed += 1;
        self.pull(index).await?;
        self.select();
        Ok(event)
    }

    /// Number of events handed out so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Drain every remaining event and return the total count.
    ///
    /// # Errors
    ///
    /// Returns the first source error encountered.
    pub async fn count(mut self) -> Result<usize, ChroniclerError> {
        while self.next().await?.is_some() {}
        Ok(self.consumed)
    }

    /// Returns `true` once every source is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }

    /// Number of wrapped sources, exhausted ones included.
    pub fn sources(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::at;

    fn stream_of(name: &str, times: &[i64]) -> (String, EventStream) {
        let events: Vec<Result<RecordedEvent, ChroniclerError>> = times
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Ok(RecordedEvent::new(
                    name,
                    i as u64 + 1,
                    "Deposited",
                    serde_json::json!({ "amount": 1 }),
                    at(*t),
                ))
            })
            .collect();
        (name.to_string(), Box::pin(tokio_stream::iter(events)))
    }

    async fn drain(merge: &mut StreamMerge) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        while let Some(event) = merge.next().await.expect("merge should not fail") {
            out.push((event.stream_name, event.position));
        }
        out
    }

    #[tokio::test]
    async fn yields_events_in_timestamp_order() {
        let mut merge = StreamMerge::new(vec![
            stream_of("A", &[1, 3, 6]),
            stream_of("B", &[2, 4]),
            stream_of("C", &[5]),
        ])
        .await
        .expect("priming should succeed");

        let order: Vec<String> = drain(&mut merge).await.into_iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec!["A", "B", "A", "B", "C", "A"]);
        assert_eq!(merge.consumed(), 6);
        assert!(merge.is_exhausted());
    }

    #[tokio::test]
    async fn count_equals_sum_of_sources() {
        let merge = StreamMerge::new(vec![
            stream_of("A", &[1, 3, 6]),
            stream_of("B", &[2, 4]),
            stream_of("C", &[5]),
        ])
        .await
        .expect("priming should succeed");

        assert_eq!(merge.count().await.expect("count should succeed"), 6);
    }

    #[tokio::test]
    async fn exposes_current_name_and_key() {
        let merge = StreamMerge::new(vec![stream_of("A", &[5, 6]), stream_of("B", &[1])])
            .await
            .expect("priming should succeed");

        assert_eq!(merge.current_stream_name(), Some("B"));
        assert_eq!(merge.current_key(), Some(1));
        assert_eq!(merge.current().map(|e| e.recorded_at), Some(at(1)));
    }

    #[tokio::test]
    async fn ties_follow_pull_order() {
        let mut merge = StreamMerge::new(vec![stream_of("A", &[1, 1]), stream_of("B", &[1])])
            .await
            .expect("priming should succeed");

        // A#1 and B#1 are primed first (in source order); A#2 is pulled last.
        assert_eq!(
            drain(&mut merge).await,
            vec![
                ("A".to_string(), 1),
                ("B".to_string(), 1),
                ("A".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn per_stream_order_is_preserved() {
        let mut merge = StreamMerge::new(vec![stream_of("A", &[1, 2, 3]), stream_of("B", &[2, 2])])
            .await
            .expect("priming should succeed");

        let events = drain(&mut merge).await;
        let a: Vec<u64> = events.iter().filter(|(s, _)| s == "A").map(|(_, p)| *p).collect();
        let b: Vec<u64> = events.iter().filter(|(s, _)| s == "B").map(|(_, p)| *p).collect();
        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(b, vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_sources_are_skipped() {
        let mut merge = StreamMerge::new(vec![stream_of("A", &[]), stream_of("B", &[3])])
            .await
            .expect("priming should succeed");
        assert_eq!(drain(&mut merge).await, vec![("B".to_string(), 1)]);
        assert_eq!(merge.sources(), 2);
    }

    #[tokio::test]
    async fn no_sources_is_exhausted() {
        let mut merge = StreamMerge::empty();
        assert!(merge.is_exhausted());
        assert!(merge.next().await.expect("no error").is_none());
        assert_eq!(merge.consumed(), 0);
    }

    #[tokio::test]
    async fn source_error_is_surfaced() {
        let failing: EventStream = Box::pin(tokio_stream::iter(vec![
            Ok(RecordedEvent::new("A", 1, "Opened", serde_json::Value::Null, at(1))),
            Err(ChroniclerError::Other("connection reset".to_string())),
        ]));
        let mut merge = StreamMerge::new(vec![("A".to_string(), failing)])
            .await
            .expect("priming should succeed");

        let err = merge.next().await.expect_err("refill should fail");
        assert!(err.to_string().contains("connection reset"));
    }
}
