//! Orchestration facade: the single entry point the daemon and the control
//! API talk to. Combines the descriptor store, installed state and the
//! process supervisor.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ToolError, ToolResult};
use crate::installed::InstalledTools;
use crate::manifest::{ManifestStore, ToolDescriptor};
use crate::supervisor::{LogLine, ProcessStatus, ProcessSupervisor, RunningInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    /// The install command ran and succeeded.
    Installed,
    /// `install.check` succeeded, so the install command was skipped.
    AlreadyPresent,
}

/// Status of one tool, whether or not it has an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatus {
    pub tool_id: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<RunningInstance>,
}

/// 카탈로그 항목 - 디스크립터 + 설치 여부 + 현재 상태
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
    pub installed: bool,
    pub status: ProcessStatus,
}

#[derive(Clone)]
pub struct ToolOrchestrator {
    manifests: Arc<ManifestStore>,
    installed: Arc<dyn InstalledTools>,
    supervisor: ProcessSupervisor,
}

impl ToolOrchestrator {
    pub fn new(
        manifests: Arc<ManifestStore>,
        installed: Arc<dyn InstalledTools>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            manifests,
            installed,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Installed copy first (that is what was installed), then the store.
    fn resolve(&self, tool_id: &str) -> ToolResult<ToolDescriptor> {
        self.installed
            .get(tool_id)
            .map(|t| t.descriptor)
            .or_else(|| self.manifests.load(tool_id))
            .ok_or_else(|| ToolError::ManifestNotFound(tool_id.to_string()))
    }

    // ─── install / uninstall ────────────────────────────────

    pub async fn install(&self, descriptor: &ToolDescriptor) -> ToolResult<InstallOutcome> {
        descriptor.validate()?;
        let tool_id = descriptor.id.as_str();
        if self.installed.is_installed(tool_id) {
            return Err(ToolError::AlreadyInstalled(tool_id.to_string()));
        }

        let check = descriptor.install.check.trim();
        let outcome = if !check.is_empty() && run_check(check).await {
            tracing::info!("'{}' is already present on this machine, skipping install", tool_id);
            InstallOutcome::AlreadyPresent
        } else {
            tracing::info!("Installing '{}': {}", tool_id, descriptor.install.command);
            run_install(&descriptor.install.command).await?;
            InstallOutcome::Installed
        };

        self.installed.add(descriptor.clone())?;
        tracing::info!("'{}' installed", tool_id);
        Ok(outcome)
    }

    /// Stop the tool if it is running, then forget it.
    pub async fn uninstall(&self, tool_id: &str) -> ToolResult<()> {
        if !self.installed.is_installed(tool_id) {
            return Err(ToolError::ManifestNotFound(tool_id.to_string()));
        }
        self.supervisor.stop(tool_id).await?;
        self.installed.remove(tool_id)?;
        tracing::info!("'{}' uninstalled", tool_id);
        Ok(())
    }

    // ─── lifecycle ──────────────────────────────────────────

    pub async fn start(&self, tool_id: &str) -> ToolResult<RunningInstance> {
        let descriptor = self.resolve(tool_id)?;
        self.supervisor.start(&descriptor).await
    }

    pub async fn stop(&self, tool_id: &str) -> ToolResult<()> {
        self.supervisor.stop(tool_id).await
    }

    pub async fn restart(&self, tool_id: &str) -> ToolResult<RunningInstance> {
        let descriptor = self.resolve(tool_id)?;
        self.supervisor.restart(&descriptor).await
    }

    /// Start every installed tool flagged `auto_start`. Failures are logged.
    pub async fn start_auto_start_tools(&self) -> usize {
        let mut started = 0;
        for tool in self.installed.list().into_iter().filter(|t| t.auto_start) {
            match self.supervisor.start(&tool.descriptor).await {
                Ok(inst) => {
                    tracing::info!("Auto-started '{}' on port {}", tool.descriptor.id, inst.port);
                    started += 1;
                }
                Err(e) => tracing::warn!("Auto-start of '{}' failed: {}", tool.descriptor.id, e),
            }
        }
        started
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down: stopping all tools");
        self.supervisor.stop_all().await;
    }

    // ─── queries ────────────────────────────────────────────

    /// Status of a known tool; unknown ids are `ManifestNotFound`.
    pub fn status(&self, tool_id: &str) -> ToolResult<ToolStatus> {
        let instance = self.supervisor.instance(tool_id);
        if instance.is_none() {
            self.resolve(tool_id)?;
        }
        Ok(ToolStatus {
            tool_id: tool_id.to_string(),
            status: instance.as_ref().map(|i| i.status).unwrap_or(ProcessStatus::Stopped),
            instance,
        })
    }

    /// The live instance of a tool, or `ProcessNotFound`.
    pub fn instance(&self, tool_id: &str) -> ToolResult<RunningInstance> {
        self.supervisor
            .instance(tool_id)
            .ok_or_else(|| ToolError::ProcessNotFound(tool_id.to_string()))
    }

    pub fn statuses(&self) -> Vec<RunningInstance> {
        self.supervisor.statuses()
    }

    pub fn logs(&self, tool_id: &str, count: usize) -> Vec<LogLine> {
        self.supervisor.logs(tool_id, count)
    }

    pub fn logs_since(&self, tool_id: &str, since: u64) -> Vec<LogLine> {
        self.supervisor.logs_since(tool_id, since)
    }

    pub fn available_to_install(&self) -> Vec<ToolDescriptor> {
        self.manifests.available_to_install(self.installed.as_ref())
    }

    /// Every known descriptor (store plus installed copies), sorted by id.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut all: BTreeMap<String, ToolDescriptor> = self
            .manifests
            .load_all()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for tool in self.installed.list() {
            all.insert(tool.descriptor.id.clone(), tool.descriptor);
        }

        all.into_values()
            .map(|descriptor| CatalogEntry {
                installed: self.installed.is_installed(&descriptor.id),
                status: self.supervisor.status(&descriptor.id),
                descriptor,
            })
            .collect()
    }

    pub fn save_manifest(&self, descriptor: &ToolDescriptor) -> ToolResult<()> {
        self.manifests.save(descriptor)
    }

    pub fn delete_manifest(&self, tool_id: &str) -> ToolResult<()> {
        self.manifests.delete(tool_id)
    }

    pub fn auto_restart(&self) -> bool {
        self.supervisor.auto_restart()
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.supervisor.set_auto_restart(enabled);
    }
}

async fn run_check(command: &str) -> bool {
    match crate::utils::shell_command(command)
        .stdin(std::process::Stdio::null())
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            tracing::debug!("Install check '{}' could not run: {}", command, e);
            false
        }
    }
}

/// Run the install command; on failure the error carries its output.
async fn run_install(command: &str) -> ToolResult<()> {
    let output = crate::utils::shell_command(command)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| ToolError::InstallationFailed(format!("could not run '{}': {}", command, e)))?;

    if output.status.success() {
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim();
    let detail = if combined.is_empty() {
        format!("'{}' exited with {}", command, output.status)
    } else {
        combined.to_string()
    };
    tracing::error!("Install command failed: {}", detail);
    Err(ToolError::InstallationFailed(detail))
}
