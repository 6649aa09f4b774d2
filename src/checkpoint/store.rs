use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Checkpoint, CheckpointError, CheckpointRecord, MAX_GAP_SPAN};
use crate::clock::Clock;

/// Holds one [`Checkpoint`] per watched stream.
///
/// Streams are kept in name order so iteration (and therefore the order
/// sources are handed to the merge iterator) is deterministic.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    checkpoints: BTreeMap<String, Checkpoint>,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    /// Create an empty store stamping new checkpoints with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            checkpoints: BTreeMap::new(),
            clock,
        }
    }

    /// Start watching every stream in `stream_names` not already tracked.
    ///
    /// New streams start at position 0 with no gaps. Already known streams
    /// keep their checkpoint untouched.
    pub fn discover<I, S>(&mut self, stream_names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in stream_names {
            let name = name.as_ref();
            if !self.checkpoints.contains_key(name) {
                let checkpoint = Checkpoint::new(name, 0, self.clock.now(), Vec::new());
                self.checkpoints.insert(name.to_owned(), checkpoint);
                tracing::debug!(stream = %name, "stream discovered");
            }
        }
    }

    /// Replace the checkpoint of `stream_name` with one at `position` carrying `gaps`.
    ///
    /// The caller guarantees `position` does not move backwards.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::UnknownStream`] if the stream is not watched.
    pub fn advance(
        &mut self,
        stream_name: &str,
        position: u64,
        gaps: Vec<u64>,
    ) -> Result<&Checkpoint, CheckpointError> {
        let now = self.clock.now();
        let slot = self
            .checkpoints
            .get_mut(stream_name)
            .ok_or_else(|| CheckpointError::UnknownStream(stream_name.to_owned()))?;
        *slot = Checkpoint::new(stream_name, position, now, gaps);
        Ok(slot)
    }

    /// Advance `stream_name` to `new_position`, recording every skipped
    /// position in between as a gap.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Outdated`] if `new_position` is not ahead of the
    ///   current position.
    /// - [`CheckpointError::DuplicateGap`] if a computed gap is already recorded.
    /// - [`CheckpointError::GapOrdering`] if the smallest computed gap sorts
    ///   before the largest recorded one.
    /// - [`CheckpointError::GapTooLarge`] if more than [`MAX_GAP_SPAN`]
    ///   positions were skipped.
    /// - [`CheckpointError::UnknownStream`] if the stream is not watched.
    pub fn advance_with_gap(
        &mut self,
        stream_name: &str,
        new_position: u64,
    ) -> Result<&Checkpoint, CheckpointError> {
        let current = self
            .checkpoints
            .get(stream_name)
            .ok_or_else(|| CheckpointError::UnknownStream(stream_name.to_owned()))?;

        if new_position <= current.position {
            return Err(CheckpointError::Outdated {
                stream: stream_name.to_owned(),
                position: new_position,
                current: current.position,
            });
        }

        if new_position - current.position - 1 > MAX_GAP_SPAN {
            return Err(CheckpointError::GapTooLarge {
                stream: stream_name.to_owned(),
                position: new_position,
                current: current.position,
            });
        }

        let new_gaps: Vec<u64> = (current.position + 1..new_position).collect();

        if let Some(&gap) = new_gaps.iter().find(|g| current.gaps.contains(g)) {
            return Err(CheckpointError::DuplicateGap {
                stream: stream_name.to_owned(),
                gap,
            });
        }

        if let (Some(&first), Some(&last)) = (new_gaps.first(), current.gaps.last())
            && first < last
        {
            return Err(CheckpointError::GapOrdering {
                stream: stream_name.to_owned(),
                gap: first,
                last,
            });
        }

        let mut gaps = current.gaps.clone();
        gaps.extend(new_gaps);
        self.advance(stream_name, new_position, gaps)
    }

    /// Returns the checkpoint of `stream_name`, if watched.
    pub fn last(&self, stream_name: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(stream_name)
    }

    /// Iterate over every watched checkpoint in stream-name order.
    pub fn all(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    /// Names of the watched streams.
    pub fn watched(&self) -> impl Iterator<Item = &str> {
        self.checkpoints.keys().map(String::as_str)
    }

    /// Replace checkpoints with persisted records.
    ///
    /// Records for streams that are not currently watched are ignored.
    pub fn sync<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a CheckpointRecord>,
    {
        for record in records {
            match self.checkpoints.get_mut(&record.stream_name) {
                Some(slot) => *slot = Checkpoint::from(record.clone()),
                None => {
                    tracing::debug!(stream = %record.stream_name, "ignoring checkpoint of unwatched stream");
                }
            }
        }
    }

    /// Forget every checkpoint.
    pub fn flush(&mut self) {
        self.checkpoints.clear();
    }

    /// Snapshot every checkpoint in its persisted shape.
    pub fn to_records(&self) -> Vec<CheckpointRecord> {
        self.checkpoints.values().map(CheckpointRecord::from).collect()
    }

    /// Returns `true` when no stream is watched.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Number of watched streams.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }
}
