//! Gap detection over per-stream positions.
//!
//! Writers commit asynchronously, so a reader can observe position `n + 2`
//! before `n + 1` becomes visible. The [`GapDetector`] decides whether such a
//! jump is still worth waiting for (retry budget left, event recent enough)
//! or should be recorded as a permanent gap. [`CheckpointTracker`] pairs it
//! with a [`CheckpointStore`] so the run loop has a single `bind` call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointRecord, CheckpointStore};
use crate::clock::Clock;

/// Result of binding an observed position to its stream's checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapOutcome {
    /// The position was the expected next one; the checkpoint moved by one.
    Advanced,
    /// A jump was seen and the retry budget is not exhausted. The checkpoint
    /// is unchanged and the caller should pause the batch and retry.
    Pending,
    /// A jump was confirmed: the skipped positions were recorded as gaps and
    /// the checkpoint moved to the observed position.
    Resolved,
}

impl GapOutcome {
    /// Returns `true` when the event at the bound position should be handled.
    pub fn is_bound(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Retry bookkeeping for one stream-watching session.
///
/// `has_retry()` is true iff the retry counter still indexes an entry of the
/// configured delay schedule. An empty schedule therefore confirms every jump
/// immediately; no detection window means staleness is never considered.
#[derive(Debug, Clone)]
pub struct GapDetector {
    retry_delays: Vec<Duration>,
    detection_window: Option<chrono::Duration>,
    retries: usize,
    gap_detected: bool,
}

impl GapDetector {
    /// # Arguments
    ///
    /// * `retry_delays` - One delay per tolerated retry of an unfilled jump.
    /// * `detection_window` - Age after which a jump is confirmed at once.
    pub fn new(retry_delays: Vec<Duration>, detection_window: Option<chrono::Duration>) -> Self {
        Self {
            retry_delays,
            detection_window,
            retries: 0,
            gap_detected: false,
        }
    }

    /// Returns `true` while the retry schedule has delays left.
    pub fn has_retry(&self) -> bool {
        self.retries < self.retry_delays.len()
    }

    /// Returns `true` while a jump is waiting to be filled.
    pub fn has_gap(&self) -> bool {
        self.gap_detected
    }

    /// Number of retry delays consumed since the last reset.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Returns `true` when a jump must be recorded as a gap right away.
    ///
    /// That is the case once the retry budget is spent, or when the event
    /// was recorded before `now - detection_window` and can no longer be an
    /// in-flight write.
    pub fn should_confirm(&self, event_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.has_retry() {
            return true;
        }
        match self.detection_window {
            Some(window) => now
                .checked_sub_signed(window)
                .is_some_and(|cutoff| event_time < cutoff),
            None => false,
        }
    }

    pub(crate) fn flag(&mut self) {
        self.gap_detected = true;
    }

    /// Consume the next retry delay, if a gap is flagged and one remains.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.gap_detected || !self.has_retry() {
            return None;
        }
        let delay = self.retry_delays[self.retries];
        self.retries += 1;
        Some(delay)
    }

    /// Wait out the next retry delay.
    ///
    /// No-op when no gap is flagged or the schedule is exhausted.
    pub async fn sleep(&mut self) {
        if let Some(delay) = self.next_delay() {
            tracing::debug!(
                retry = self.retries,
                delay_ms = delay.as_millis() as u64,
                "waiting for gap to fill"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Restore the full retry budget and clear the pending flag.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.gap_detected = false;
    }
}

/// Checkpoints plus gap detection for the streams of one projector.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    checkpoints: CheckpointStore,
    detector: GapDetector,
    clock: Arc<dyn Clock>,
}

impl CheckpointTracker {
    /// Start with no watched stream; call [`discover`](Self::discover) next.
    pub fn new(detector: GapDetector, clock: Arc<dyn Clock>) -> Self {
        Self {
            checkpoints: CheckpointStore::new(Arc::clone(&clock)),
            detector,
            clock,
        }
    }

    /// Bind an observed `position` of `stream_name` to its checkpoint.
    ///
    /// # Arguments
    ///
    /// * `stream_name` - Watched stream the event was read from.
    /// * `position` - Store-assigned position of the event.
    /// * `event_time` - When the event was recorded; compared against the
    ///   detection window.
    ///
    /// # Returns
    ///
    /// [`GapOutcome::Advanced`] for the next expected position,
    /// [`GapOutcome::Resolved`] when a jump is confirmed and
    /// [`GapOutcome::Pending`] when the caller should wait and retry.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Outdated`] when `position` is not ahead of
    /// the checkpoint, and [`CheckpointError::UnknownStream`] when the stream
    /// was never discovered.
    pub fn bind(
        &mut self,
        stream_name: &str,
        position: u64,
        event_time: DateTime<Utc>,
    ) -> Result<GapOutcome, CheckpointError> {
        let checkpoint = self
            .checkpoints
            .last(stream_name)
            .ok_or_else(|| CheckpointError::UnknownStream(stream_name.to_owned()))?;
        let current = checkpoint.position();

        if position <= current {
            return Err(CheckpointError::Outdated {
                stream: stream_name.to_owned(),
                position,
                current,
            });
        }

        if position == current + 1 {
            let gaps = checkpoint.gaps().to_vec();
            self.checkpoints.advance(stream_name, position, gaps)?;
            self.detector.reset();
            return Ok(GapOutcome::Advanced);
        }

        if self.detector.should_confirm(event_time, self.clock.now()) {
            self.checkpoints.advance_with_gap(stream_name, position)?;
            tracing::warn!(
                stream = %stream_name,
                position,
                first_gap = current + 1,
                last_gap = position - 1,
                retries = self.detector.retries(),
                "gap recorded"
            );
            self.detector.reset();
            return Ok(GapOutcome::Resolved);
        }

        self.detector.flag();
        tracing::debug!(
            stream = %stream_name,
            expected = current + 1,
            position,
            "gap detected"
        );
        Ok(GapOutcome::Pending)
    }

    /// Returns `true` while a jump on any stream is waiting to be filled.
    pub fn has_gap(&self) -> bool {
        self.detector.has_gap()
    }

    /// Returns `true` while the retry schedule has delays left.
    pub fn has_retry(&self) -> bool {
        self.detector.has_retry()
    }

    /// Wait out the next retry delay of a pending gap.
    pub async fn sleep(&mut self) {
        self.detector.sleep().await;
    }

    /// Start watching streams not seen before, at position 0.
    pub fn discover<I, S>(&mut self, stream_names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.checkpoints.discover(stream_names);
    }

    /// Adopt persisted checkpoints of watched streams.
    pub fn sync<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a CheckpointRecord>,
    {
        self.checkpoints.sync(records);
    }

    /// Forget every checkpoint and any pending gap.
    pub fn flush(&mut self) {
        self.checkpoints.flush();
        self.detector.reset();
    }

    /// Latest checkpoint of `stream_name`, if watched.
    pub fn last(&self, stream_name: &str) -> Option<&Checkpoint> {
        self.checkpoints.last(stream_name)
    }

    /// Underlying checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Latest checkpoint of every watched stream, in persisted form.
    pub fn to_records(&self) -> Vec<CheckpointRecord> {
        self.checkpoints.to_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::{at, epoch};

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    fn tracker(retries: &[u64], window: Option<chrono::Duration>) -> (CheckpointTracker, ManualClock) {
        let clock = ManualClock::new(epoch());
        let detector = GapDetector::new(millis(retries), window);
        let mut tracker = CheckpointTracker::new(detector, Arc::new(clock.clone()));
        tracker.discover(["s"]);
        (tracker, clock)
    }

    fn move_to(tracker: &mut CheckpointTracker, position: u64) {
        for p in 1..=position {
            assert_eq!(
                tracker.bind("s", p, epoch()).expect("bind should succeed"),
                GapOutcome::Advanced
            );
        }
    }

    #[test]
    fn next_position_advances() {
        let (mut tracker, _) = tracker(&[5], None);
        assert_eq!(tracker.bind("s", 1, epoch()).expect("bind"), GapOutcome::Advanced);
        assert_eq!(tracker.last("s").expect("watched").position(), 1);
        assert!(!tracker.has_gap());
    }

    #[test]
    fn outdated_position_is_an_error() {
        let (mut tracker, _) = tracker(&[5], None);
        move_to(&mut tracker, 3);
        for position in [1, 3] {
            let err = tracker.bind("s", position, epoch()).expect_err("outdated");
            assert!(matches!(err, CheckpointError::Outdated { current: 3, .. }));
        }
    }

    #[test]
    fn unknown_stream_is_an_error() {
        let (mut tracker, _) = tracker(&[5], None);
        let err = tracker.bind("other", 1, epoch()).expect_err("unknown");
        assert_eq!(err, CheckpointError::UnknownStream("other".to_string()));
    }

    #[test]
    fn empty_schedule_confirms_every_jump() {
        let (mut tracker, _) = tracker(&[], None);
        assert_eq!(tracker.bind("s", 3, epoch()).expect("bind"), GapOutcome::Resolved);
        let cp = tracker.last("s").expect("watched");
        assert_eq!(cp.position(), 3);
        assert_eq!(cp.gaps(), &[1, 2]);
        assert!(!tracker.has_gap());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_of_three_allows_exactly_three_sleeps() {
        let (mut tracker, _) = tracker(&[5, 10, 20], None);
        move_to(&mut tracker, 1);

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            assert_eq!(tracker.bind("s", 4, epoch()).expect("bind"), GapOutcome::Pending);
            assert!(tracker.has_gap());
            tracker.sleep().await;
        }
        let slept = started.elapsed();
        assert!(slept >= Duration::from_millis(35));
        assert!(!tracker.has_retry());

        // Exhausted schedule: further sleeps are no-ops.
        tracker.sleep().await;
        assert_eq!(started.elapsed(), slept);

        assert_eq!(tracker.bind("s", 4, epoch()).expect("bind"), GapOutcome::Resolved);
        assert!(!tracker.has_gap());
        assert!(tracker.has_retry());
        assert_eq!(tracker.last("s").expect("watched").gaps(), &[2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_jump_after_retries_and_records_gaps() {
        let (mut tracker, _) = tracker(&[1, 2, 3], None);
        move_to(&mut tracker, 4);

        assert_eq!(tracker.bind("s", 5, epoch()).expect("bind"), GapOutcome::Advanced);
        assert_eq!(tracker.bind("s", 6, epoch()).expect("bind"), GapOutcome::Advanced);

        for _ in 0..3 {
            assert_eq!(tracker.bind("s", 10, epoch()).expect("bind"), GapOutcome::Pending);
            tracker.sleep().await;
        }
        assert_eq!(tracker.bind("s", 10, epoch()).expect("bind"), GapOutcome::Resolved);

        let cp = tracker.last("s").expect("watched");
        assert_eq!(cp.position(), 10);
        assert_eq!(cp.gaps(), &[7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_without_gap_is_a_no_op() {
        let (mut tracker, _) = tracker(&[50], None);
        let started = tokio::time::Instant::now();
        tracker.sleep().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(tracker.has_retry());
    }

    #[test]
    fn filled_gap_resets_detector() {
        let (mut tracker, _) = tracker(&[5, 10], None);
        assert_eq!(tracker.bind("s", 2, epoch()).expect("bind"), GapOutcome::Pending);
        let _ = tracker.detector.next_delay();
        assert_eq!(tracker.detector.retries(), 1);

        // The missing write became visible.
        assert_eq!(tracker.bind("s", 1, epoch()).expect("bind"), GapOutcome::Advanced);
        assert!(!tracker.has_gap());
        assert_eq!(tracker.detector.retries(), 0);
        assert_eq!(tracker.bind("s", 2, epoch()).expect("bind"), GapOutcome::Advanced);
        assert!(tracker.last("s").expect("watched").gaps().is_empty());
    }

    #[test]
    fn event_older_than_window_is_confirmed_immediately() {
        let window = chrono::Duration::seconds(60);
        let (mut tracker, clock) = tracker(&[5, 10, 20], Some(window));
        clock.set(at(600));

        assert_eq!(tracker.bind("s", 3, at(10)).expect("bind"), GapOutcome::Resolved);
        assert_eq!(tracker.last("s").expect("watched").gaps(), &[1, 2]);
    }

    #[test]
    fn recent_event_within_window_waits() {
        let window = chrono::Duration::seconds(60);
        let (mut tracker, clock) = tracker(&[5], Some(window));
        clock.set(at(600));

        assert_eq!(tracker.bind("s", 3, at(590)).expect("bind"), GapOutcome::Pending);
        assert_eq!(tracker.last("s").expect("watched").position(), 0);
    }

    #[test]
    fn window_beyond_calendar_range_never_confirms() {
        let window = chrono::Duration::milliseconds(i64::MAX);
        let (mut tracker, _) = tracker(&[5], Some(window));
        assert_eq!(tracker.bind("s", 3, epoch()).expect("bind"), GapOutcome::Pending);
    }

    #[test]
    fn flush_clears_checkpoints_and_pending_gap() {
        let (mut tracker, _) = tracker(&[5], None);
        assert_eq!(tracker.bind("s", 3, epoch()).expect("bind"), GapOutcome::Pending);
        tracker.flush();
        assert!(!tracker.has_gap());
        assert!(tracker.checkpoints().is_empty());
    }

    #[test]
    fn outcome_bound_flag() {
        assert!(GapOutcome::Advanced.is_bound());
        assert!(GapOutcome::Resolved.is_bound());
        assert!(!GapOutcome::Pending.is_bound());
    }
}
