//! Rebuilds screen states from a persisted timeline.

pub mod engine;

pub use engine::{replay_timeline, ParseWarning, ReplayOptions, ReplayResult, ReplaySession};

use crate::errors::TimewalkerError;
use crate::terminal::TerminalState;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Screen state captured at a labeled point of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub raw_offset: u64,
    pub state_digest: String,
    /// Rendered rows, trailing blanks trimmed.
    pub text: Vec<String>,
    pub state: TerminalState,
}

impl Keyframe {
    pub fn capture(
        label: &str,
        step_index: Option<usize>,
        raw_offset: u64,
        state: TerminalState,
    ) -> Self {
        Self {
            label: label.to_string(),
            step_index,
            raw_offset,
            state_digest: state.digest(),
            text: state.text_lines(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyframeSet {
    pub scenario: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub keyframes: Vec<Keyframe>,
}

impl KeyframeSet {
    pub fn get(&self, label: &str) -> Option<&Keyframe> {
        self.keyframes.iter().find(|keyframe| keyframe.label == label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.keyframes.iter().map(|k| k.label.clone()).collect()
    }

    pub fn to_json(&self) -> Result<String, TimewalkerError> {
        serde_json::to_string_pretty(self).map_err(|e| TimewalkerError::Io(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), TimewalkerError> {
        std::fs::write(path, self.to_json()?)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
    }

    pub fn load(path: &Path) -> Result<Self, TimewalkerError> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&body)
            .map_err(|e| TimewalkerError::ReplayReconstruction(format!("{}: {e}", path.display())))
    }
}
