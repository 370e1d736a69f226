use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_PASS: i32 = 0;
pub const EXIT_EXECUTION_ERROR: i32 = 1;
pub const EXIT_FAIL_VERDICT: i32 = 2;
pub const EXIT_INVALID_SCENARIO: i32 = 3;
pub const EXIT_USAGE: i32 = 64;
/// 128 + SIGINT, as shells report an interrupted command.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum TimewalkerError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("invalid scenario: {0}")]
    ScenarioValidation(String),
    #[error("session failed at step {step_index:?}: {message} (bundle: {})", .bundle.display())]
    SessionExecution {
        step_index: Option<usize>,
        bundle: PathBuf,
        message: String,
    },
    #[error("step {step_index} timed out after {timeout_ms}ms (bundle: {}); output tail: {tail:?}", .bundle.display())]
    StepTimeout {
        step_index: usize,
        timeout_ms: u64,
        bundle: PathBuf,
        tail: String,
    },
    #[error("session cancelled (bundle: {})", .bundle.display())]
    Cancelled { bundle: PathBuf },
    #[error("replay reconstruction error: {0}")]
    ReplayReconstruction(String),
    #[error("classifier error: {0}")]
    Classifier(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("baseline conflict: {0}")]
    BaselineConflict(String),
    #[error("baseline not found: {0}")]
    BaselineNotFound(String),
}

impl TimewalkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ScenarioValidation(_) => EXIT_INVALID_SCENARIO,
            Self::Cli(_) | Self::InvalidConfig(_) | Self::ConfigParse(_) => EXIT_USAGE,
            Self::Cancelled { .. } => EXIT_CANCELLED,
            _ => EXIT_EXECUTION_ERROR,
        }
    }

    /// Partial result bundle left behind by an aborted run, if any.
    pub fn bundle(&self) -> Option<&PathBuf> {
        match self {
            Self::SessionExecution { bundle, .. }
            | Self::StepTimeout { bundle, .. }
            | Self::Cancelled { bundle } => Some(bundle),
            _ => None,
        }
    }
}
