//! Gap-aware, lock-protected projections over append-only event streams.

pub mod checkpoint;
mod chronicler;
mod clock;
mod counter;
mod emitter;
mod error;
mod event;
pub mod gap;
mod lock;
mod manager;
pub mod merge;
mod options;
mod projection;
mod projector;
pub mod repository;
mod status;
pub mod workflow;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointRecord, CheckpointStore, MAX_GAP_SPAN,
};
pub use chronicler::{Chronicler, ChroniclerError, InMemoryChronicler};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{EventCounter, IdleThrottle};
pub use emitter::{Emitter, StreamCache};
pub use error::{ProjectionError, ReactionError};
pub use event::{ProposedEvent, RecordedEvent};
pub use gap::{CheckpointTracker, GapDetector, GapOutcome};
pub use lock::LockManager;
pub use manager::{ProjectionBuilder, ProjectorManager, QueryBuilder};
pub use merge::{EventStream, StreamMerge};
pub use options::{
    DEFAULT_RETRIES, MAX_SPAN_MILLIS, OptionsError, ProjectionOptions, SleepOption,
    parse_iso8601_duration,
};
pub use projection::{EmitError, Emission, Projection, ReactionScope};
pub use projector::{PersistentProjector, QueryProjector};
pub use repository::{
    CheckpointRecorder, InMemoryProjectionRepository, JsonFileRepository, ProjectionRecord,
    ProjectionRepository, ProjectionStore, RepositoryError,
};
pub use status::{ProjectionStatus, UnknownStatus};
pub use workflow::{StopHandle, StreamScope};
