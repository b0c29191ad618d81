//! Descriptor store: a read-only bundled directory plus a user-writable one.
//! User entries override bundled entries with the same id.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{validate_id, ToolDescriptor};
use crate::error::{ToolError, ToolResult};
use crate::installed::InstalledTools;

pub struct ManifestStore {
    bundled_dir: PathBuf,
    user_dir: PathBuf,
    cached: RwLock<Option<Vec<ToolDescriptor>>>,
}

impl ManifestStore {
    pub fn new(bundled_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundled_dir: bundled_dir.into(),
            user_dir: user_dir.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// 캐시를 무효화합니다 (디스크의 매니페스트가 바뀌었을 때 호출)
    pub fn invalidate_cache(&self) {
        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::debug!("Manifest cache invalidated");
    }

    /// All known descriptors, one per id, sorted by id.
    pub fn load_all(&self) -> Vec<ToolDescriptor> {
        if let Some(list) = self.cached.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return list.clone();
        }

        let mut merged: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        for desc in read_dir_descriptors(&self.bundled_dir) {
            merged.insert(desc.id.clone(), desc);
        }
        for desc in read_dir_descriptors(&self.user_dir) {
            if merged.contains_key(&desc.id) {
                tracing::debug!("User manifest '{}' overrides bundled copy", desc.id);
            }
            merged.insert(desc.id.clone(), desc);
        }

        let list: Vec<ToolDescriptor> = merged.into_values().collect();
        tracing::info!("Loaded {} tool manifests", list.len());
        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = Some(list.clone());
        list
    }

    /// The user copy wins over the bundled one. Invalid files are never returned.
    pub fn load(&self, id: &str) -> Option<ToolDescriptor> {
        find_in_dir(&self.user_dir, id).or_else(|| find_in_dir(&self.bundled_dir, id))
    }

    pub fn validate(&self, descriptor: &ToolDescriptor) -> ToolResult<()> {
        descriptor.validate()
    }

    /// Validate and write `<user_dir>/<id>.json`, replacing any previous copy.
    pub fn save(&self, descriptor: &ToolDescriptor) -> ToolResult<()> {
        descriptor.validate()?;
        fs::create_dir_all(&self.user_dir).map_err(ToolError::storage)?;

        let path = self.user_dir.join(format!("{}.json", descriptor.id));
        let content = serde_json::to_string_pretty(descriptor).map_err(ToolError::storage)?;
        fs::write(&path, content).map_err(ToolError::storage)?;

        // 같은 id 를 가진 다른 사용자 파일이 남아 있으면 새 사본과 충돌하므로 제거
        for stale in user_files_for(&self.user_dir, &descriptor.id) {
            if stale != path {
                fs::remove_file(&stale).map_err(ToolError::storage)?;
            }
        }

        self.invalidate_cache();
        tracing::info!("Saved manifest '{}' to {}", descriptor.id, path.display());
        Ok(())
    }

    /// Remove every user-set file holding `id`. Bundled descriptors can't be deleted.
    ///
    /// Only files that parse to the requested id are removed; broken files are left alone.
    pub fn delete(&self, id: &str) -> ToolResult<()> {
        validate_id(id)?;

        let mut removed = false;
        for path in user_files_for(&self.user_dir, id) {
            fs::remove_file(&path).map_err(ToolError::storage)?;
            tracing::debug!("Removed {}", path.display());
            removed = true;
        }
        if !removed {
            return Err(ToolError::ManifestNotFound(id.to_string()));
        }
        self.invalidate_cache();
        tracing::info!("Deleted user manifest '{}'", id);
        Ok(())
    }

    /// Every known descriptor that isn't installed yet.
    pub fn available_to_install(&self, installed: &dyn InstalledTools) -> Vec<ToolDescriptor> {
        self.load_all()
            .into_iter()
            .filter(|d| !installed.is_installed(&d.id))
            .collect()
    }
}

fn read_descriptor(path: &Path) -> ToolResult<ToolDescriptor> {
    let content = fs::read_to_string(path).map_err(ToolError::storage)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => ToolDescriptor::from_toml(&content),
        _ => ToolDescriptor::from_json(&content),
    }
}

fn is_descriptor_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("toml")
        )
}

fn read_dir_descriptors(dir: &Path) -> Vec<ToolDescriptor> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            tracing::debug!("Manifest directory {} does not exist", dir.display());
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_descriptor_file(&path) {
            continue;
        }
        match read_descriptor(&path) {
            Ok(desc) => out.push(desc),
            Err(e) => tracing::warn!("Skipping manifest {}: {}", path.display(), e),
        }
    }
    out
}

fn find_in_dir(dir: &Path, id: &str) -> Option<ToolDescriptor> {
    // 파일명이 id 와 일치하는 경우를 먼저 확인하고, 아니면 디렉터리 전체를 훑음
    for ext in ["json", "toml"] {
        let path = dir.join(format!("{}.{}", id, ext));
        if path.is_file() {
            if let Ok(desc) = read_descriptor(&path) {
                if desc.id == id {
                    return Some(desc);
                }
            }
        }
    }
    read_dir_descriptors(dir).into_iter().find(|d| d.id == id)
}

/// Descriptor files in `dir` that parse to `id`, whatever their file name.
fn user_files_for(dir: &Path, id: &str) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_descriptor_file(path))
        .filter(|path| matches!(read_descriptor(path), Ok(desc) if desc.id == id))
        .collect()
}
