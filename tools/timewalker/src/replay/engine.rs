//! Replay: feed a fresh terminal machine the recorded output stream.
//!
//! Output chunks and resizes are applied in timeline order, so a keyframe is
//! rebuilt from exactly the bytes and geometry the live session had seen when
//! it was captured. Machine clones are kept every `checkpoint_interval` bytes
//! so [`ReplaySession::state_at`] does not start from zero each time.

use crate::errors::TimewalkerError;
use crate::logging::append_run_log;
use crate::replay::Keyframe;
use crate::terminal::{TerminalMachine, TerminalNotice, TerminalState, UnknownReason};
use crate::timeline::{EventKind, StateNotice, Timeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub offset: u64,
    pub sequence: String,
    pub reason: UnknownReason,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Only these labels, in timeline order. `None` means every snapshot.
    pub labels: Option<Vec<String>>,
    pub checkpoint_interval: u64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            labels: None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub keyframes: Vec<Keyframe>,
    pub parse_warnings: Vec<ParseWarning>,
    pub timeline_warnings: Vec<String>,
    pub final_state: TerminalState,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Feed { start: u64, end: u64 },
    Resize { rows: u16, cols: u16 },
}

struct Checkpoint {
    /// State after applying `ops[..next_op]`.
    next_op: usize,
    machine: TerminalMachine,
}

pub struct ReplaySession<'a> {
    timeline: &'a Timeline,
    ops: Vec<Op>,
    checkpoints: Vec<Checkpoint>,
    result: ReplayResult,
}

fn fresh_machine(timeline: &Timeline) -> TerminalMachine {
    let terminal = &timeline.metadata.terminal;
    TerminalMachine::new(
        terminal.rows,
        terminal.cols,
        terminal.capabilities.clone(),
        terminal.scrollback_limit,
    )
}

fn corrupt(message: impl Into<String>) -> TimewalkerError {
    TimewalkerError::ReplayReconstruction(message.into())
}

impl<'a> ReplaySession<'a> {
    /// Replays the whole timeline once, verifying every recorded snapshot.
    pub fn new(timeline: &'a Timeline, options: &ReplayOptions) -> Result<Self, TimewalkerError> {
        let recorded = timeline.snapshot_labels();
        let mut seen = BTreeSet::new();
        for label in &recorded {
            if !seen.insert(label.as_str()) {
                return Err(corrupt(format!("snapshot label `{label}` recorded twice")));
            }
        }
        let wanted: Option<BTreeSet<&str>> = match &options.labels {
            Some(labels) => {
                for label in labels {
                    if !seen.contains(label.as_str()) {
                        return Err(corrupt(format!("label `{label}` is not in the timeline")));
                    }
                }
                Some(labels.iter().map(String::as_str).collect())
            }
            None => None,
        };

        let interval = options.checkpoint_interval.max(1);
        let raw = timeline.raw_bytes();
        let mut machine = fresh_machine(timeline);
        let mut ops = Vec::new();
        let mut checkpoints = Vec::new();
        let mut next_checkpoint = interval;
        let mut keyframes = Vec::new();
        let mut parse_warnings = Vec::new();

        for event in &timeline.events {
            match &event.kind {
                EventKind::RawOutput { offset, len, .. } => {
                    let (start, end) = (*offset, offset + len);
                    let notices = machine.append_bytes(&raw[start as usize..end as usize]);
                    collect_warnings(notices, &mut parse_warnings);
                    ops.push(Op::Feed { start, end });
                    if machine.bytes_fed() >= next_checkpoint {
                        checkpoints.push(Checkpoint {
                            next_op: ops.len(),
                            machine: machine.clone(),
                        });
                        next_checkpoint = machine.bytes_fed() + interval;
                    }
                }
                EventKind::StateNotice {
                    notice:
                        StateNotice::Resize {
                            rows,
                            cols,
                            raw_offset,
                            ..
                        },
                } => {
                    if *raw_offset != machine.bytes_fed() {
                        return Err(corrupt(format!(
                            "resize recorded at offset {raw_offset} but {} bytes were replayed",
                            machine.bytes_fed()
                        )));
                    }
                    machine.resize(*rows, *cols);
                    ops.push(Op::Resize {
                        rows: *rows,
                        cols: *cols,
                    });
                }
                EventKind::Snapshot {
                    step_index,
                    label,
                    raw_offset,
                    state_digest,
                } => {
                    if *raw_offset != machine.bytes_fed() {
                        return Err(corrupt(format!(
                            "snapshot `{label}` recorded at offset {raw_offset} but {} bytes were replayed",
                            machine.bytes_fed()
                        )));
                    }
                    let keyframe =
                        Keyframe::capture(label, Some(*step_index), *raw_offset, machine.current_grid());
                    if keyframe.state_digest != *state_digest {
                        return Err(corrupt(format!(
                            "snapshot `{label}` replays to digest {} but {state_digest} was recorded",
                            keyframe.state_digest
                        )));
                    }
                    if wanted
                        .as_ref()
                        .map_or(true, |wanted| wanted.contains(label.as_str()))
                    {
                        keyframes.push(keyframe);
                    }
                }
                _ => {}
            }
        }

        append_run_log(
            "debug",
            "replay.completed",
            json!({
                "bundle": timeline.dir.display().to_string(),
                "bytes": machine.bytes_fed(),
                "keyframes": keyframes.len(),
                "checkpoints": checkpoints.len(),
                "parse_warnings": parse_warnings.len(),
            }),
        );

        Ok(Self {
            timeline,
            ops,
            checkpoints,
            result: ReplayResult {
                keyframes,
                parse_warnings,
                timeline_warnings: timeline.warnings.clone(),
                final_state: machine.current_grid(),
                total_bytes: machine.bytes_fed(),
            },
        })
    }

    pub fn result(&self) -> &ReplayResult {
        &self.result
    }

    pub fn into_result(self) -> ReplayResult {
        self.result
    }

    /// State after the first `offset` output bytes, including any resize
    /// recorded at exactly that offset.
    pub fn state_at(&self, offset: u64) -> Result<TerminalState, TimewalkerError> {
        if offset > self.result.total_bytes {
            return Err(corrupt(format!(
                "offset {offset} is past the end of the recorded output ({} bytes)",
                self.result.total_bytes
            )));
        }
        let (mut machine, first_op) = match self
            .checkpoints
            .iter()
            .rev()
            .find(|checkpoint| checkpoint.machine.bytes_fed() <= offset)
        {
            Some(checkpoint) => (checkpoint.machine.clone(), checkpoint.next_op),
            None => (fresh_machine(self.timeline), 0),
        };
        let raw = self.timeline.raw_bytes();
        for op in &self.ops[first_op..] {
            match *op {
                Op::Feed { start, end } => {
                    if start >= offset {
                        break;
                    }
                    let stop = end.min(offset);
                    machine.append_bytes(&raw[start as usize..stop as usize]);
                    if stop < end {
                        break;
                    }
                }
                Op::Resize { rows, cols } => machine.resize(rows, cols),
            }
        }
        Ok(machine.current_grid())
    }
}

fn collect_warnings(notices: Vec<TerminalNotice>, out: &mut Vec<ParseWarning>) {
    for notice in notices {
        if let TerminalNotice::UnknownSequence {
            sequence,
            reason,
            offset,
        } = notice
        {
            out.push(ParseWarning {
                offset,
                sequence,
                reason,
            });
        }
    }
}

/// One-shot replay of a loaded timeline.
pub fn replay_timeline(
    timeline: &Timeline,
    options: &ReplayOptions,
) -> Result<ReplayResult, TimewalkerError> {
    Ok(ReplaySession::new(timeline, options)?.into_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;
    use crate::terminal::CapabilitySet;
    use crate::timeline::event::{
        PlatformInfo, ScenarioIdentity, SessionMetadata, TerminalSettings, BUNDLE_FORMAT_VERSION,
    };
    use crate::timeline::TimelineRecorder;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    /// Records `chunks` through a live machine, snapshotting after each chunk
    /// whose label is `Some`.
    fn record(dir: &Path, steps: &[(&str, Option<&str>)]) -> Timeline {
        let metadata = SessionMetadata {
            format_version: BUNDLE_FORMAT_VERSION,
            run_id: "r".to_string(),
            scenario: ScenarioIdentity {
                name: "s".to_string(),
                description: String::new(),
                digest: String::new(),
                source: None,
            },
            vars: BTreeMap::new(),
            command: vec!["sh".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            terminal: TerminalSettings {
                rows: 3,
                cols: 10,
                scrollback_limit: 5,
                capabilities: CapabilitySet::all(),
            },
            platform: PlatformInfo::current(),
            tool_version: "t".to_string(),
            started_wall_ns: 0,
        };
        let recorder = TimelineRecorder::create(dir, &metadata, Arc::new(FakeClock::default()))
            .expect("create");
        let mut live = TerminalMachine::new(3, 10, CapabilitySet::all(), 5);
        for (idx, (chunk, label)) in steps.iter().enumerate() {
            let chunk = chunk.as_bytes();
            if !chunk.is_empty() {
                recorder.record_output(chunk).expect("output");
                live.append_bytes(chunk);
            }
            if let Some(label) = label {
                recorder
                    .record_snapshot(idx, label, live.bytes_fed(), &live.current_grid().digest())
                    .expect("snapshot");
            }
        }
        Timeline::load(dir).expect("load")
    }

    #[test]
    fn keyframes_follow_snapshot_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = record(
            dir.path(),
            &[
                ("one\r\n", Some("first")),
                ("\x1b[31mtwo\x1b[0m", None),
                ("\r\nthree", Some("second")),
            ],
        );
        let result = replay_timeline(&timeline, &ReplayOptions::default()).expect("replay");
        let labels: Vec<&str> = result.keyframes.iter().map(|k| k.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "second"]);
        assert_eq!(result.keyframes[0].text[0], "one");
        assert_eq!(result.keyframes[1].text, vec!["one", "two", "three"]);
    }

    #[test]
    fn replay_is_repeatable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = record(
            dir.path(),
            &[("a\x1b[2J\x1b[Hb\x1b[5n", Some("x")), ("c\r\nd", Some("y"))],
        );
        let first = replay_timeline(&timeline, &ReplayOptions::default()).expect("replay");
        for _ in 0..3 {
            let again = replay_timeline(&timeline, &ReplayOptions::default()).expect("replay");
            assert_eq!(again.keyframes, first.keyframes);
            assert_eq!(again.final_state, first.final_state);
        }
        assert_eq!(first.parse_warnings.len(), 1);
        assert_eq!(first.parse_warnings[0].reason, UnknownReason::Unsupported);
    }

    #[test]
    fn label_filter_selects_and_rejects_unknown_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = record(dir.path(), &[("a", Some("x")), ("b", Some("y"))]);
        let only_y = ReplayOptions {
            labels: Some(vec!["y".to_string()]),
            ..ReplayOptions::default()
        };
        let result = replay_timeline(&timeline, &only_y).expect("replay");
        assert_eq!(result.keyframes.len(), 1);
        assert_eq!(result.keyframes[0].label, "y");
        let missing = ReplayOptions {
            labels: Some(vec!["z".to_string()]),
            ..ReplayOptions::default()
        };
        assert!(matches!(
            replay_timeline(&timeline, &missing),
            Err(TimewalkerError::ReplayReconstruction(_))
        ));
    }

    #[test]
    fn state_at_matches_a_straight_replay_with_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunks: Vec<String> = (0..20)
            .map(|i| format!("line{i}\r\n\x1b[1m*\x1b[0m"))
            .collect();
        let steps: Vec<(&str, Option<&str>)> =
            chunks.iter().map(|c| (c.as_str(), None)).collect();
        let timeline = record(dir.path(), &steps);
        let options = ReplayOptions {
            labels: None,
            checkpoint_interval: 16,
        };
        let session = ReplaySession::new(&timeline, &options).expect("session");
        let raw = timeline.raw_bytes();
        for offset in [0, 1, 7, 16, 17, 100, raw.len() as u64] {
            let mut straight = TerminalMachine::new(3, 10, CapabilitySet::all(), 5);
            straight.append_bytes(&raw[..offset as usize]);
            assert_eq!(
                session.state_at(offset).expect("state"),
                straight.current_grid(),
                "offset {offset}"
            );
        }
        assert!(session.state_at(raw.len() as u64 + 1).is_err());
    }

    #[test]
    fn tampered_digest_fails_the_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        record(dir.path(), &[("abc", Some("x"))]);
        let path = dir.path().join(crate::timeline::TIMELINE_FILE);
        let text = std::fs::read_to_string(&path).expect("read");
        let timeline_text = text.replace("\"state_digest\":\"", "\"state_digest\":\"ff");
        std::fs::write(&path, timeline_text).expect("write");
        let timeline = Timeline::load(dir.path()).expect("load");
        assert!(matches!(
            replay_timeline(&timeline, &ReplayOptions::default()),
            Err(TimewalkerError::ReplayReconstruction(_))
        ));
    }
}
