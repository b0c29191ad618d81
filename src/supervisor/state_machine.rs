use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of one tool instance.
///
/// "Not running" is the absence of an instance and has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Crashed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Crashed => "crashed",
        }
    }

    /// `Stopped` and `Crashed` end an instance; nothing but a fresh start
    /// follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessStatus, ProcessStatus),
}

pub fn can_transition(from: ProcessStatus, to: ProcessStatus) -> bool {
    use ProcessStatus::*;
    matches!(
        (from, to),
        (Starting, Running)
            | (Starting, Error)
            | (Starting, Stopped)
            | (Running, Error)
            | (Error, Running)
            | (Running, Stopped)
            | (Error, Stopped)
            | (Running, Crashed)
            | (Error, Crashed)
            // 크래시 후 정리(stop)는 허용
            | (Crashed, Stopped)
    )
}

/// Move `state` to `to` if the lifecycle allows it. Same-state moves are no-ops.
pub fn transition(state: &mut ProcessStatus, to: ProcessStatus) -> Result<(), TransitionError> {
    if *state == to {
        return Ok(());
    }
    if can_transition(*state, to) {
        tracing::debug!("State transition: {:?} -> {:?}", state, to);
        *state = to;
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(*state, to))
    }
}
