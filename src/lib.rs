pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod installed;
pub mod ipc;
pub mod manifest;
pub mod orchestrator;
pub mod port;
pub mod process_monitor;
pub mod supervisor;
pub mod utils;

pub use error::{ToolError, ToolResult};
pub use manifest::ToolDescriptor;
pub use orchestrator::ToolOrchestrator;
pub use supervisor::{ProcessStatus, ProcessSupervisor, RunningInstance, SupervisorConfig};
