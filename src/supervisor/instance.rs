use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::state_machine::ProcessStatus;
use super::state_machine::{self, TransitionError};
use crate::utils::current_timestamp;

/// One live (or just-ended) execution of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInstance {
    /// Distinguishes successive runs of the same tool.
    pub instance_id: Uuid,
    pub tool_id: String,
    pub port: u16,
    /// Set once the process has been spawned.
    pub pid: Option<u32>,
    pub started_at: u64,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RunningInstance {
    pub fn starting(tool_id: &str, port: u16) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            port,
            pid: None,
            started_at: current_timestamp(),
            status: ProcessStatus::Starting,
            last_health_check: None,
            exit_code: None,
        }
    }

    pub fn transition(&mut self, to: ProcessStatus) -> Result<(), TransitionError> {
        state_machine::transition(&mut self.status, to)
    }

    pub fn mark_healthy(&mut self) {
        self.last_health_check = Some(current_timestamp());
    }

    pub fn uptime_secs(&self) -> u64 {
        current_timestamp().saturating_sub(self.started_at)
    }
}
