//! Result bundle timeline: the handoff between a recorded session and replay.

pub mod event;
pub mod reader;
pub mod recorder;

pub use event::{
    EventKind, SessionMetadata, SessionOutcome, StateNotice, TimelineEvent, TimelineLine,
};
pub use reader::Timeline;
pub use recorder::TimelineRecorder;

pub const TIMELINE_FILE: &str = "timeline.jsonl";
pub const RAW_FILE: &str = "raw.bin";
pub const KEYFRAMES_FILE: &str = "keyframes.json";
pub const OUTCOME_FILE: &str = "outcome.json";
pub const RUN_LOG_FILE: &str = "run.log.jsonl";
