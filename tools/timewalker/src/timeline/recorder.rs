//! Append-only, crash-safe writer for a result bundle's timeline.

use crate::digest::hex_bytes;
use crate::errors::TimewalkerError;
use crate::runtime::Clock;
use crate::timeline::event::{EventKind, SessionMetadata, StateNotice, TimelineEvent, TimelineLine};
use crate::timeline::{RAW_FILE, TIMELINE_FILE};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

struct RecorderInner {
    timeline: File,
    raw: File,
    next_seq: u64,
    raw_offset: u64,
    last_mono_ns: u64,
    closed: bool,
}

/// Every event is written through to the file before the call returns.
/// Snapshots and state notices are additionally fsynced.
pub struct TimelineRecorder {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    inner: Mutex<RecorderInner>,
}

fn io_err(path: &Path, e: std::io::Error) -> TimewalkerError {
    TimewalkerError::Io(format!("{}: {e}", path.display()))
}

fn rewind_raw(raw: &mut File, offset: u64) -> std::io::Result<()> {
    raw.set_len(offset)?;
    raw.seek(SeekFrom::Start(offset))?;
    Ok(())
}

impl TimelineRecorder {
    /// Creates `dir`, truncates any previous timeline, and writes `metadata`
    /// as the first line.
    pub fn create(
        dir: &Path,
        metadata: &SessionMetadata,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TimewalkerError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let timeline_path = dir.join(TIMELINE_FILE);
        let raw_path = dir.join(RAW_FILE);
        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|e| io_err(path, e))
        };
        let mut timeline = open(&timeline_path)?;
        let raw = open(&raw_path)?;

        let line = serde_json::to_string(&TimelineLine::Metadata(metadata.clone()))
            .map_err(|e| TimewalkerError::Io(e.to_string()))?;
        writeln!(timeline, "{line}").map_err(|e| io_err(&timeline_path, e))?;
        timeline.sync_data().map_err(|e| io_err(&timeline_path, e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            inner: Mutex::new(RecorderInner {
                timeline,
                raw,
                next_seq: 1,
                raw_offset: 0,
                last_mono_ns: 0,
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn raw_offset(&self) -> u64 {
        self.lock().map(|inner| inner.raw_offset).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderInner>, TimewalkerError> {
        self.inner
            .lock()
            .map_err(|_| TimewalkerError::Io("timeline recorder lock poisoned".to_string()))
    }

    /// Appends `chunk` to `raw.bin` and records a `RawOutput` event for it.
    pub fn record_output(&self, chunk: &[u8]) -> Result<TimelineEvent, TimewalkerError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(TimewalkerError::Io("timeline already closed".to_string()));
        }
        let raw_path = self.dir.join(RAW_FILE);
        let offset = inner.raw_offset;
        let appended = inner
            .raw
            .write_all(chunk)
            .map_err(|e| io_err(&raw_path, e))
            .and_then(|()| {
                self.append(
                    &mut inner,
                    EventKind::RawOutput {
                        offset,
                        len: chunk.len() as u64,
                        data_hex: hex_bytes(chunk),
                    },
                    false,
                )
            });
        match appended {
            Ok(event) => {
                inner.raw_offset += chunk.len() as u64;
                Ok(event)
            }
            Err(error) => {
                // raw.bin must never hold bytes no event accounts for.
                if let Err(rewind) = rewind_raw(&mut inner.raw, offset) {
                    tracing::warn!(%rewind, offset, "could not roll back raw output");
                }
                Err(error)
            }
        }
    }

    pub fn record_input(
        &self,
        step_index: Option<usize>,
        text: &str,
        injected: bool,
    ) -> Result<TimelineEvent, TimewalkerError> {
        let mut inner = self.lock()?;
        self.append(
            &mut inner,
            EventKind::InputSent {
                step_index,
                text: text.to_string(),
                injected,
            },
            false,
        )
    }

    /// `raw_offset` is the number of output bytes the captured state reflects.
    pub fn record_snapshot(
        &self,
        step_index: usize,
        label: &str,
        raw_offset: u64,
        state_digest: &str,
    ) -> Result<TimelineEvent, TimewalkerError> {
        let mut inner = self.lock()?;
        if raw_offset > inner.raw_offset {
            return Err(TimewalkerError::Io(format!(
                "snapshot `{label}` at offset {raw_offset} is past recorded output {}",
                inner.raw_offset
            )));
        }
        self.append(
            &mut inner,
            EventKind::Snapshot {
                step_index,
                label: label.to_string(),
                raw_offset,
                state_digest: state_digest.to_string(),
            },
            true,
        )
    }

    pub fn record_notice(&self, notice: StateNotice) -> Result<TimelineEvent, TimewalkerError> {
        let mut inner = self.lock()?;
        self.append(&mut inner, EventKind::StateNotice { notice }, true)
    }

    /// Records the terminal `Finished` notice. Later appends fail.
    pub fn finish(&self, notice: StateNotice) -> Result<TimelineEvent, TimewalkerError> {
        let mut inner = self.lock()?;
        let event = self.append(&mut inner, EventKind::StateNotice { notice }, true)?;
        let raw_path = self.dir.join(RAW_FILE);
        inner.raw.sync_data().map_err(|e| io_err(&raw_path, e))?;
        inner.closed = true;
        Ok(event)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    fn append(
        &self,
        inner: &mut RecorderInner,
        kind: EventKind,
        durable: bool,
    ) -> Result<TimelineEvent, TimewalkerError> {
        if inner.closed {
            return Err(TimewalkerError::Io("timeline already closed".to_string()));
        }
        // Clamped so a misbehaving clock cannot reorder events.
        let mono_ns = self.clock.monotonic_ns().max(inner.last_mono_ns);
        let event = TimelineEvent {
            seq: inner.next_seq,
            mono_ns,
            wall_ns: self.clock.wall_ns(),
            kind,
        };
        let mut line = serde_json::to_string(&TimelineLine::Event(event.clone()))
            .map_err(|e| TimewalkerError::Io(e.to_string()))?;
        line.push('\n');
        let timeline_path = self.dir.join(TIMELINE_FILE);
        inner
            .timeline
            .write_all(line.as_bytes())
            .map_err(|e| io_err(&timeline_path, e))?;
        if durable {
            inner
                .timeline
                .sync_data()
                .map_err(|e| io_err(&timeline_path, e))?;
        }
        inner.next_seq += 1;
        inner.last_mono_ns = mono_ns;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;
    use crate::terminal::CapabilitySet;
    use crate::timeline::event::{
        PlatformInfo, ScenarioIdentity, TerminalSettings, BUNDLE_FORMAT_VERSION,
    };
    use std::collections::BTreeMap;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            format_version: BUNDLE_FORMAT_VERSION,
            run_id: "run-1".to_string(),
            scenario: ScenarioIdentity {
                name: "demo".to_string(),
                description: String::new(),
                digest: "0".repeat(64),
                source: None,
            },
            vars: BTreeMap::new(),
            command: vec!["/bin/sh".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            terminal: TerminalSettings {
                rows: 4,
                cols: 20,
                scrollback_limit: 10,
                capabilities: CapabilitySet::all(),
            },
            platform: PlatformInfo::current(),
            tool_version: "test".to_string(),
            started_wall_ns: 1,
        }
    }

    #[test]
    fn every_event_is_on_disk_before_the_call_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TimelineRecorder::create(dir.path(), &metadata(), Arc::new(FakeClock::default()))
                .expect("create recorder");
        recorder.record_output(b"ab").expect("output");
        recorder.record_input(Some(0), "ls\n", false).expect("input");
        recorder.record_output(b"cde").expect("output");

        let text = fs::read_to_string(dir.path().join(TIMELINE_FILE)).expect("read timeline");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"record\":\"metadata\""));
        assert!(lines[3].contains("\"offset\":2"));
        assert_eq!(fs::read(dir.path().join(RAW_FILE)).expect("read raw"), b"abcde");
        assert_eq!(recorder.raw_offset(), 5);
    }

    #[test]
    fn sequence_and_monotonic_time_follow_append_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TimelineRecorder::create(dir.path(), &metadata(), Arc::new(FakeClock::default()))
                .expect("create recorder");
        let events: Vec<TimelineEvent> = (0..5)
            .map(|i| recorder.record_output(&[b'a' + i]).expect("output"))
            .collect();
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[1].mono_ns >= pair[0].mono_ns);
        }
    }

    #[test]
    fn finish_closes_the_timeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TimelineRecorder::create(dir.path(), &metadata(), Arc::new(FakeClock::default()))
                .expect("create recorder");
        recorder
            .finish(StateNotice::Cancelled {
                reason: "test".to_string(),
            })
            .expect("finish");
        assert!(recorder.is_closed());
        assert!(recorder.record_output(b"late").is_err());
        assert!(recorder.record_snapshot(0, "x", 0, "d").is_err());
    }

    #[test]
    fn failed_output_append_leaves_the_offset_and_raw_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TimelineRecorder::create(dir.path(), &metadata(), Arc::new(FakeClock::default()))
                .expect("create recorder");
        recorder.record_output(b"ok").expect("output");

        // A read-only handle makes every timeline write fail.
        let writable = {
            let mut inner = recorder.inner.lock().expect("recorder lock");
            let read_only = File::open(dir.path().join(TIMELINE_FILE)).expect("open read-only");
            std::mem::replace(&mut inner.timeline, read_only)
        };
        assert!(recorder.record_output(b"lost").is_err());
        assert_eq!(recorder.raw_offset(), 2);
        assert_eq!(fs::read(dir.path().join(RAW_FILE)).expect("read raw"), b"ok");

        recorder.inner.lock().expect("recorder lock").timeline = writable;
        let event = recorder.record_output(b"next").expect("output");
        assert!(matches!(event.kind, EventKind::RawOutput { offset: 2, len: 4, .. }));
        assert_eq!(fs::read(dir.path().join(RAW_FILE)).expect("read raw"), b"oknext");
        assert_eq!(recorder.raw_offset(), 6);
    }

    #[test]
    fn snapshot_cannot_point_past_recorded_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TimelineRecorder::create(dir.path(), &metadata(), Arc::new(FakeClock::default()))
                .expect("create recorder");
        recorder.record_output(b"xyz").expect("output");
        assert!(recorder.record_snapshot(0, "a", 3, "d").is_ok());
        assert!(recorder.record_snapshot(1, "b", 4, "d").is_err());
    }
}
