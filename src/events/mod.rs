//! Status change notifications. The supervisor calls every registered
//! observer on each status transition; consumers subscribe without the core
//! knowing who they are.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::supervisor::instance::ProcessStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub tool_id: String,
    pub status: ProcessStatus,
    pub timestamp: u64,
}

pub trait StatusObserver: Send + Sync {
    fn on_status_changed(&self, tool_id: &str, status: ProcessStatus);
}

/// Fans status changes out to any number of async subscribers.
pub struct BroadcastObserver {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Lagging or absent receivers are ignored.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusObserver for BroadcastObserver {
    fn on_status_changed(&self, tool_id: &str, status: ProcessStatus) {
        self.publish(StatusEvent {
            tool_id: tool_id.to_string(),
            status,
            timestamp: crate::utils::current_timestamp(),
        });
    }
}

/// Writes every transition to the log.
pub struct LoggingObserver;

impl StatusObserver for LoggingObserver {
    fn on_status_changed(&self, tool_id: &str, status: ProcessStatus) {
        match status {
            ProcessStatus::Crashed | ProcessStatus::Error => {
                tracing::warn!("[{}] status -> {:?}", tool_id, status)
            }
            _ => tracing::info!("[{}] status -> {:?}", tool_id, status),
        }
    }
}
