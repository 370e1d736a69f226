//! Loads and validates a persisted timeline.

use crate::digest::decode_hex;
use crate::errors::TimewalkerError;
use crate::timeline::event::{
    EventKind, SessionMetadata, SessionOutcome, StateNotice, TimelineEvent, TimelineLine,
    BUNDLE_FORMAT_VERSION,
};
use crate::timeline::{RAW_FILE, TIMELINE_FILE};
use std::path::{Path, PathBuf};

/// A parsed, validated timeline with its raw output stream.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub dir: PathBuf,
    pub metadata: SessionMetadata,
    pub events: Vec<TimelineEvent>,
    /// Recoverable oddities, e.g. a half-written final line after a crash.
    pub warnings: Vec<String>,
    raw: Vec<u8>,
}

fn corrupt(message: impl Into<String>) -> TimewalkerError {
    TimewalkerError::ReplayReconstruction(message.into())
}

impl Timeline {
    pub fn load(dir: &Path) -> Result<Self, TimewalkerError> {
        let path = dir.join(TIMELINE_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| corrupt(format!("{}: {e}", path.display())))?;

        let mut warnings = Vec::new();
        let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
        // Bytes after the final newline are a line that never finished writing.
        let trailing = lines.pop().unwrap_or_default();

        let mut parsed = Vec::with_capacity(lines.len() + 1);
        for (idx, line) in lines.iter().enumerate() {
            let line = std::str::from_utf8(line)
                .map_err(|e| corrupt(format!("timeline line {}: not utf-8: {e}", idx + 1)))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TimelineLine = serde_json::from_str(line)
                .map_err(|e| corrupt(format!("timeline line {}: {e}", idx + 1)))?;
            parsed.push(record);
        }
        if !trailing.iter().all(u8::is_ascii_whitespace) {
            let record = std::str::from_utf8(trailing)
                .ok()
                .and_then(|line| serde_json::from_str::<TimelineLine>(line).ok());
            match record {
                Some(record) => parsed.push(record),
                None => warnings.push(format!(
                    "ignored truncated final timeline line {} ({} bytes)",
                    lines.len() + 1,
                    trailing.len()
                )),
            }
        }

        let mut records = parsed.into_iter();
        let metadata = match records.next() {
            Some(TimelineLine::Metadata(metadata)) => metadata,
            Some(TimelineLine::Event(_)) => {
                return Err(corrupt("timeline does not start with a metadata record"))
            }
            None => return Err(corrupt("timeline is empty")),
        };
        if metadata.format_version != BUNDLE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported bundle format version {}",
                metadata.format_version
            )));
        }

        let mut events: Vec<TimelineEvent> = Vec::new();
        let mut raw = Vec::new();
        for record in records {
            let event = match record {
                TimelineLine::Event(event) => event,
                TimelineLine::Metadata(_) => {
                    return Err(corrupt("timeline has a second metadata record"))
                }
            };
            if let Some(previous) = events.last() {
                if event.seq != previous.seq + 1 {
                    return Err(corrupt(format!(
                        "event seq {} follows {}",
                        event.seq, previous.seq
                    )));
                }
                if event.mono_ns < previous.mono_ns {
                    return Err(corrupt(format!(
                        "event seq {} goes back in monotonic time",
                        event.seq
                    )));
                }
            }
            if let EventKind::RawOutput {
                offset,
                len,
                data_hex,
            } = &event.kind
            {
                if *offset != raw.len() as u64 {
                    return Err(corrupt(format!(
                        "event seq {} has output offset {offset}, expected {}",
                        event.seq,
                        raw.len()
                    )));
                }
                let data = decode_hex(data_hex)
                    .map_err(|e| corrupt(format!("event seq {}: {e}", event.seq)))?;
                if data.len() as u64 != *len {
                    return Err(corrupt(format!(
                        "event seq {} declares {len} bytes but carries {}",
                        event.seq,
                        data.len()
                    )));
                }
                raw.extend_from_slice(&data);
            }
            events.push(event);
        }

        let raw_path = dir.join(RAW_FILE);
        match std::fs::read(&raw_path) {
            Ok(on_disk) => {
                if on_disk.len() < raw.len() || on_disk[..raw.len()] != raw[..] {
                    return Err(corrupt(format!(
                        "{} does not match the recorded output events",
                        raw_path.display()
                    )));
                }
                if on_disk.len() > raw.len() {
                    warnings.push(format!(
                        "{} has {} bytes with no output event",
                        RAW_FILE,
                        on_disk.len() - raw.len()
                    ));
                }
            }
            Err(_) => warnings.push(format!("{RAW_FILE} is missing; using event payloads")),
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
            events,
            warnings,
            raw,
        })
    }

    /// The whole output stream, in order.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn total_output(&self) -> u64 {
        self.raw.len() as u64
    }

    /// The final outcome, absent when the session crashed before finishing.
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.events.iter().rev().find_map(|event| match &event.kind {
            EventKind::StateNotice {
                notice: StateNotice::Finished { outcome },
            } => Some(outcome),
            _ => None,
        })
    }

    pub fn snapshot_labels(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::Snapshot { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }
}
