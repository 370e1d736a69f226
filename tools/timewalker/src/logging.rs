use crate::errors::TimewalkerError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_unix_ms: u64,
    pub pid: u32,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, level: &str, event_type: &str, payload: Value) -> Result<(), TimewalkerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TimewalkerError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            ts_unix_ms: unix_ms(),
            pid: std::process::id(),
            level,
            event_type,
            payload: truncate_json(payload, self.max_payload_bytes),
        })
        .map_err(|e| TimewalkerError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TimewalkerError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| TimewalkerError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| TimewalkerError::Io(e.to_string()))?;
        Ok(())
    }

    /// Appends to the file and mirrors the entry to `tracing`. Write failures are
    /// reported through `tracing` only.
    pub fn log(&self, level: &str, event_type: &str, payload: Value) {
        emit_tracing(level, event_type, &payload);
        if let Err(error) = self.append(level, event_type, payload) {
            tracing::warn!(event_type, %error, "run log append failed");
        }
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<JsonlLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<JsonlLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route process-level log entries to `path` in addition to `tracing`.
pub fn init_run_logger(path: impl AsRef<Path>) -> Result<(), TimewalkerError> {
    let logger = JsonlLogger::new(path);
    if let Some(parent) = logger.path.parent() {
        fs::create_dir_all(parent).map_err(|e| TimewalkerError::Io(e.to_string()))?;
    }
    let mut slot = logger_slot()
        .lock()
        .map_err(|_| TimewalkerError::Io("run logger lock poisoned".to_string()))?;
    *slot = Some(Arc::new(logger));
    Ok(())
}

pub fn clear_run_logger() {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = None;
    }
}

/// Process-level structured log. Always reaches `tracing`; also lands in the
/// JSONL file when one was configured with [`init_run_logger`].
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = logger_slot()
        .lock()
        .ok()
        .and_then(|slot| slot.as_ref().map(Arc::clone));
    match logger {
        Some(logger) => logger.log(level, event_type, payload),
        None => emit_tracing(level, event_type, &payload),
    }
}

fn emit_tracing(level: &str, event_type: &str, payload: &Value) {
    match level {
        "error" => tracing::error!(event_type, %payload),
        "warn" => tracing::warn!(event_type, %payload),
        "debug" => tracing::debug!(event_type, %payload),
        "trace" => tracing::trace!(event_type, %payload),
        _ => tracing::info!(event_type, %payload),
    }
}

/// Installs the stderr `tracing` subscriber. `TIMEWALKER_LOG` overrides the filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("TIMEWALKER_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
