//! Serializable timeline records.
//!
//! `timeline.jsonl` holds one `TimelineLine` per line: the session metadata
//! first, then every event in append order.

use crate::terminal::CapabilitySet;
use crate::types::ControllerState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

// ── TimelineLine ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TimelineLine {
    Metadata(SessionMetadata),
    Event(TimelineEvent),
}

// ── Metadata ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioIdentity {
    pub name: String,
    pub description: String,
    /// sha256 of the scenario as loaded, so edits to a scenario are visible.
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSettings {
    pub rows: u16,
    pub cols: u16,
    pub scrollback_limit: usize,
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub format_version: u32,
    pub run_id: String,
    pub scenario: ScenarioIdentity,
    pub vars: BTreeMap<String, String>,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Variables set on the child on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub terminal: TerminalSettings,
    pub platform: PlatformInfo,
    pub tool_version: String,
    pub started_wall_ns: u64,
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub seq: u64,
    pub mono_ns: u64,
    pub wall_ns: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// `len` bytes at `offset` in `raw.bin`; `data_hex` carries the same bytes.
    RawOutput {
        offset: u64,
        len: u64,
        data_hex: String,
    },
    InputSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
        text: String,
        /// Sent by the controller itself (prompt and alias setup).
        injected: bool,
    },
    Snapshot {
        step_index: usize,
        label: String,
        raw_offset: u64,
        state_digest: String,
    },
    StateNotice {
        notice: StateNotice,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum StateNotice {
    WaitMatched {
        step_index: usize,
        predicate: String,
        evidence: String,
        raw_offset: u64,
    },
    /// Replay applies the resize once `raw_offset` bytes have been fed.
    Resize {
        step_index: usize,
        rows: u16,
        cols: u16,
        raw_offset: u64,
    },
    ProcessExited {
        code: u32,
        success: bool,
    },
    Cancelled {
        reason: String,
    },
    Finished {
        outcome: SessionOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub state: ControllerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    pub steps_completed: usize,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == ControllerState::Finished(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureKind;

    #[test]
    fn lines_are_tagged_by_record_and_type() {
        let line = TimelineLine::Event(TimelineEvent {
            seq: 3,
            mono_ns: 10,
            wall_ns: 20,
            kind: EventKind::StateNotice {
                notice: StateNotice::Finished {
                    outcome: SessionOutcome {
                        state: ControllerState::Finished(Some(FailureKind::StepTimeout)),
                        step_index: Some(1),
                        message: None,
                        exit_code: None,
                        steps_completed: 1,
                    },
                },
            },
        });
        let json: serde_json::Value =
            serde_json::to_value(&line).expect("serialize timeline line");
        assert_eq!(json["record"], "event");
        assert_eq!(json["kind"]["type"], "state_notice");
        assert_eq!(json["kind"]["notice"]["notice"], "finished");
        assert_eq!(json["kind"]["notice"]["outcome"]["state"]["failure"], "step_timeout");
        let back: TimelineLine = serde_json::from_value(json).expect("parse timeline line");
        assert_eq!(back, line);
    }
}
