use crate::errors::TimewalkerError;
use crate::types::{ControllerState, FailureKind};

/// Lifecycle of one session controller. `Finished` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerFsm {
    pub state: ControllerState,
    pub failure_step: Option<usize>,
    pub failure_reason: Option<String>,
}

impl Default for ControllerFsm {
    fn default() -> Self {
        Self {
            state: ControllerState::Idle,
            failure_step: None,
            failure_reason: None,
        }
    }
}

impl ControllerFsm {
    pub fn start(&mut self) -> Result<(), TimewalkerError> {
        self.transition(ControllerState::Running)
    }

    pub fn begin_wait(&mut self) -> Result<(), TimewalkerError> {
        self.transition(ControllerState::WaitingOnPredicate)
    }

    pub fn end_wait(&mut self) -> Result<(), TimewalkerError> {
        self.transition(ControllerState::Running)
    }

    pub fn succeed(&mut self) -> Result<(), TimewalkerError> {
        self.transition(ControllerState::Finished(None))
    }

    /// Records a failure. A controller that already finished keeps its first outcome.
    pub fn fail(&mut self, kind: FailureKind, step_index: Option<usize>, reason: impl Into<String>) {
        if self.state.is_finished() {
            return;
        }
        self.state = ControllerState::Finished(Some(kind));
        self.failure_step = step_index;
        self.failure_reason = Some(reason.into());
    }

    fn transition(&mut self, to: ControllerState) -> Result<(), TimewalkerError> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }
}

pub fn validate_transition(from: ControllerState, to: ControllerState) -> Result<(), TimewalkerError> {
    use ControllerState as S;

    let allowed = match from {
        S::Idle => matches!(to, S::Running | S::Finished(Some(_))),
        S::Running => matches!(to, S::WaitingOnPredicate | S::Finished(_)),
        S::WaitingOnPredicate => matches!(to, S::Running | S::Finished(Some(_))),
        S::Finished(_) => false,
    };

    if !allowed {
        return Err(TimewalkerError::SessionExecution {
            step_index: None,
            bundle: std::path::PathBuf::new(),
            message: format!("illegal transition: {:?} -> {:?}", from, to),
        });
    }
    Ok(())
}
