use std::fs;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::{ToolError, ToolResult};
use crate::manifest::ToolDescriptor;
use crate::utils::current_timestamp;

/// Installed-tool state as seen by the orchestrator.
///
/// Kept behind a trait so the orchestrator doesn't care where the list lives.
pub trait InstalledTools: Send + Sync {
    fn is_installed(&self, id: &str) -> bool;
    fn add(&self, descriptor: ToolDescriptor) -> ToolResult<()>;
    fn remove(&self, id: &str) -> ToolResult<()>;
    fn get(&self, id: &str) -> Option<InstalledTool>;
    fn list(&self) -> Vec<InstalledTool>;
}

/// 설치된 도구 - 사용자가 설치한 매니페스트와 사용자 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledTool {
    pub descriptor: ToolDescriptor,
    pub installed_at: u64,
    /// 데몬 시작 시 자동 실행 여부
    #[serde(default)]
    pub auto_start: bool,
}

/// JSON file backed installed-tool list (`installed.json`).
pub struct InstalledStore {
    file_path: PathBuf,
    tools: RwLock<Vec<InstalledTool>>,
}

impl InstalledStore {
    /// Open the store, loading the file if it exists.
    pub fn open(file_path: impl Into<PathBuf>) -> ToolResult<Self> {
        let store = Self {
            file_path: file_path.into(),
            tools: RwLock::new(Vec::new()),
        };
        store.load()?;
        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<InstalledTool>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<InstalledTool>> {
        self.tools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 파일에서 설치 목록 로드
    pub fn load(&self) -> ToolResult<()> {
        if !self.file_path.exists() {
            tracing::info!("Installed state file does not exist, starting empty");
            self.write().clear();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path).map_err(ToolError::storage)?;
        let tools: Vec<InstalledTool> =
            serde_json::from_str(&content).map_err(ToolError::storage)?;
        tracing::info!("Loaded {} installed tools", tools.len());
        *self.write() = tools;
        Ok(())
    }

    fn save(&self, tools: &[InstalledTool]) -> ToolResult<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(ToolError::storage)?;
            }
        }
        let content = serde_json::to_string_pretty(tools).map_err(ToolError::storage)?;
        fs::write(&self.file_path, content).map_err(ToolError::storage)?;
        tracing::debug!("Saved {} installed tools", tools.len());
        Ok(())
    }

    pub fn set_auto_start(&self, id: &str, enabled: bool) -> ToolResult<()> {
        let mut tools = self.write();
        let tool = tools
            .iter_mut()
            .find(|t| t.descriptor.id == id)
            .ok_or_else(|| ToolError::ManifestNotFound(id.to_string()))?;
        tool.auto_start = enabled;
        self.save(&tools)
    }
}

impl InstalledTools for InstalledStore {
    fn is_installed(&self, id: &str) -> bool {
        self.read().iter().any(|t| t.descriptor.id == id)
    }

    /// Adding an id that already exists replaces its descriptor but keeps the
    /// user's flags.
    fn add(&self, descriptor: ToolDescriptor) -> ToolResult<()> {
        descriptor.validate()?;
        let mut tools = self.write();
        match tools.iter_mut().find(|t| t.descriptor.id == descriptor.id) {
            Some(existing) => existing.descriptor = descriptor,
            None => tools.push(InstalledTool {
                descriptor,
                installed_at: current_timestamp(),
                auto_start: false,
            }),
        }
        self.save(&tools)
    }

    fn remove(&self, id: &str) -> ToolResult<()> {
        let mut tools = self.write();
        let before = tools.len();
        tools.retain(|t| t.descriptor.id != id);
        if tools.len() == before {
            return Err(ToolError::ManifestNotFound(id.to_string()));
        }
        self.save(&tools)
    }

    fn get(&self, id: &str) -> Option<InstalledTool> {
        self.read().iter().find(|t| t.descriptor.id == id).cloned()
    }

    fn list(&self) -> Vec<InstalledTool> {
        self.read().clone()
    }
}
