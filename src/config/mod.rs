use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::port::{PortAllocator, DEFAULT_RANGE_MAX, DEFAULT_RANGE_MIN};
use crate::supervisor::{SupervisorConfig, DEFAULT_PORT_FLAG};

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "TOOLPORT_CONFIG";

pub const DEFAULT_IPC_LISTEN: &str = "127.0.0.1:57480";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Control API listen address
    pub ipc_listen: String,
    /// 배포판에 포함된 매니페스트 디렉토리
    pub bundled_manifests_dir: PathBuf,
    /// 사용자가 추가/수정한 매니페스트 디렉토리
    pub user_manifests_dir: PathBuf,
    pub installed_state_path: PathBuf,
    pub auto_restart: bool,
    pub ports: PortsConfig,
    pub timing: TimingConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    pub default_min: u16,
    pub default_max: u16,
    /// Flag used to pass the port to dynamic-port tools
    pub port_flag: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub health_timeout_ms: u64,
    pub health_poll_ms: u64,
    pub monitor_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub restart_cooldown_ms: u64,
    pub restart_pause_ms: u64,
    pub log_buffer_lines: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: DEFAULT_IPC_LISTEN.to_string(),
            bundled_manifests_dir: PathBuf::from("./manifests"),
            user_manifests_dir: PathBuf::from("./user-manifests"),
            installed_state_path: PathBuf::from("./installed.json"),
            auto_restart: true,
            ports: PortsConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            default_min: DEFAULT_RANGE_MIN,
            default_max: DEFAULT_RANGE_MAX,
            port_flag: DEFAULT_PORT_FLAG.to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            health_timeout_ms: 30_000,
            health_poll_ms: 500,
            monitor_interval_ms: 5_000,
            stop_grace_ms: 2_000,
            restart_cooldown_ms: 3_000,
            restart_pause_ms: 1_000,
            log_buffer_lines: 1_000,
        }
    }
}

impl GlobalConfig {
    /// Load from `$TOOLPORT_CONFIG`, or `config/global.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&s).with_context(|| format!("Failed to parse {}", path.display()))?;
        cfg.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ports.default_min == 0 || self.ports.default_max < self.ports.default_min {
            anyhow::bail!(
                "invalid [ports] range {}-{}",
                self.ports.default_min,
                self.ports.default_max
            );
        }
        if self.ports.port_flag.trim().is_empty() {
            anyhow::bail!("[ports] port_flag must not be empty");
        }
        if self.timing.health_poll_ms == 0 || self.timing.monitor_interval_ms == 0 {
            anyhow::bail!("[timing] health_poll_ms and monitor_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let t = &self.timing;
        SupervisorConfig {
            health_timeout: Duration::from_millis(t.health_timeout_ms),
            health_poll_interval: Duration::from_millis(t.health_poll_ms),
            monitor_interval: Duration::from_millis(t.monitor_interval_ms),
            stop_grace: Duration::from_millis(t.stop_grace_ms),
            restart_cooldown: Duration::from_millis(t.restart_cooldown_ms),
            restart_pause: Duration::from_millis(t.restart_pause_ms),
            log_buffer_lines: t.log_buffer_lines,
            port_flag: self.ports.port_flag.clone(),
            auto_restart: self.auto_restart,
        }
    }

    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::new(self.ports.default_min, self.ports.default_max)
    }
}
