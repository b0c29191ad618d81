//! Process supervisor: runs tool processes on resolved ports, waits for them
//! to become healthy, watches their health and exit, and stops them.
//!
//! Operations on one tool id are serialized by a per-id async lock. Exit and
//! health notifications arrive on background tasks and only touch the
//! instance table, never the operation locks. Every notification carries the
//! instance id it was registered for, so events from an older run of the same
//! tool are dropped.

pub mod instance;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{ToolError, ToolResult};
use crate::events::StatusObserver;
use crate::health::HealthChecker;
use crate::manifest::ToolDescriptor;
use crate::port::PortAllocator;

pub use instance::{ProcessStatus, RunningInstance};
pub use managed_process::{LogBuffer, LogLine, LogSource, ManagedProcess, ProcessExit, SpawnOptions};

/// Flag appended (with the port) to the start command of dynamic-port tools.
pub const DEFAULT_PORT_FLAG: &str = "--port";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a fresh process gets to answer its health check.
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Poll interval of the background monitor once running.
    pub monitor_interval: Duration,
    /// SIGTERM to SIGKILL escalation delay.
    pub stop_grace: Duration,
    pub restart_cooldown: Duration,
    /// Pause between stop and start in `restart`.
    pub restart_pause: Duration,
    pub log_buffer_lines: usize,
    pub port_flag: String,
    pub auto_restart: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            restart_cooldown: Duration::from_secs(3),
            restart_pause: Duration::from_secs(1),
            log_buffer_lines: managed_process::DEFAULT_LOG_BUFFER,
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            auto_restart: true,
        }
    }
}

/// Instance table entry.
struct Slot {
    instance: RunningInstance,
    descriptor: ToolDescriptor,
    process: Option<Arc<ManagedProcess>>,
    /// The port is given back exactly once, whichever path ends the instance.
    port_held: bool,
}

impl Slot {
    /// Whether a start request should be answered with this instance.
    fn is_active(&self) -> bool {
        match self.instance.status {
            ProcessStatus::Starting | ProcessStatus::Running => true,
            // 헬스 저하 상태(프로세스 살아 있음)만 활성으로 취급
            ProcessStatus::Error => self.process.is_some(),
            ProcessStatus::Stopped | ProcessStatus::Crashed => false,
        }
    }

    fn release_port(&mut self, ports: &PortAllocator) {
        if self.port_held {
            self.port_held = false;
            ports.release(self.instance.port);
        }
    }
}

enum StartOutcome {
    Health(bool),
    Exited(ProcessExit),
}

struct Inner {
    config: SupervisorConfig,
    auto_restart: AtomicBool,
    ports: Arc<PortAllocator>,
    health: HealthChecker,
    slots: Mutex<HashMap<String, Slot>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    logs: Mutex<HashMap<String, Arc<LogBuffer>>>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
}

/// Cheap to clone; all clones share one instance table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, ports: Arc<PortAllocator>, health: HealthChecker) -> Self {
        let auto_restart = AtomicBool::new(config.auto_restart);
        Self {
            inner: Arc::new(Inner {
                config,
                auto_restart,
                ports,
                health,
                slots: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    pub fn health(&self) -> &HealthChecker {
        &self.inner.health
    }

    pub fn add_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn auto_restart(&self) -> bool {
        self.inner.auto_restart.load(Ordering::SeqCst)
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.inner.auto_restart.store(enabled, Ordering::SeqCst);
        tracing::info!("Auto-restart {}", if enabled { "enabled" } else { "disabled" });
    }

    // ─── internal helpers ───────────────────────────────────

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn op_lock(&self, tool_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .op_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tool_id.to_string())
            .or_default()
            .clone()
    }

    fn log_buffer(&self, tool_id: &str) -> Arc<LogBuffer> {
        let capacity = self.inner.config.log_buffer_lines;
        self.inner
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tool_id.to_string())
            .or_insert_with(|| Arc::new(LogBuffer::with_capacity(capacity)))
            .clone()
    }

    fn notify(&self, tool_id: &str, status: ProcessStatus) {
        let observers: Vec<Arc<dyn StatusObserver>> = self
            .inner
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_status_changed(tool_id, status);
        }
    }

    fn active_instance(&self, tool_id: &str) -> Option<RunningInstance> {
        self.slots()
            .get(tool_id)
            .filter(|slot| slot.is_active())
            .map(|slot| slot.instance.clone())
    }

    // ─── lifecycle ──────────────────────────────────────────

    /// Start `descriptor` unless an instance is already active, in which case
    /// that instance is returned unchanged.
    pub async fn start(&self, descriptor: &ToolDescriptor) -> ToolResult<RunningInstance> {
        descriptor.validate()?;
        let tool_id = descriptor.id.as_str();

        if let Some(existing) = self.active_instance(tool_id) {
            tracing::info!("'{}' is already {}, not starting again", tool_id, existing.status);
            return Ok(existing);
        }

        let lock = self.op_lock(tool_id);
        let _guard = lock.lock().await;

        // 락 대기 중에 다른 요청이 시작했을 수 있음
        if let Some(existing) = self.active_instance(tool_id) {
            tracing::info!("'{}' was started concurrently, returning it", tool_id);
            return Ok(existing);
        }

        self.start_locked(descriptor).await
    }

    async fn start_locked(&self, descriptor: &ToolDescriptor) -> ToolResult<RunningInstance> {
        let tool_id = descriptor.id.as_str();
        let config = &self.inner.config;

        let port = match self.inner.ports.resolve_port_for(descriptor) {
            Some(port) => port,
            None => {
                tracing::warn!("No available port for '{}'", tool_id);
                return Err(ToolError::NoAvailablePort);
            }
        };

        let instance = RunningInstance::starting(tool_id, port);
        let instance_id = instance.instance_id;
        self.slots().insert(
            tool_id.to_string(),
            Slot {
                instance,
                descriptor: descriptor.clone(),
                process: None,
                port_held: true,
            },
        );
        self.notify(tool_id, ProcessStatus::Starting);

        let options = SpawnOptions {
            command_line: compose_command_line(descriptor, port, &config.port_flag),
            env: compose_environment(descriptor, port),
            working_dir: descriptor.start.working_directory.as_ref().map(PathBuf::from),
        };
        let logs = self.log_buffer(tool_id);
        logs.push(
            LogSource::System,
            format!("Starting '{}' on port {}: {}", tool_id, port, options.command_line),
        );
        tracing::info!("Starting '{}' on port {}", tool_id, port);

        let process = match ManagedProcess::spawn(&options, logs.clone()) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                let msg = format!("failed to spawn '{}': {}", options.command_line, e);
                tracing::error!("{}", msg);
                logs.push(LogSource::System, msg.clone());
                self.fail_start(tool_id, instance_id, None);
                return Err(ToolError::FailedToStart(msg));
            }
        };

        if let Some(slot) = self.slots().get_mut(tool_id) {
            if slot.instance.instance_id == instance_id {
                slot.instance.pid = Some(process.pid);
                slot.process = Some(process.clone());
            }
        }

        let url = descriptor.health_url(port);
        let outcome = tokio::select! {
            healthy = self.inner.health.wait_until_healthy(&url, config.health_timeout, config.health_poll_interval) => {
                StartOutcome::Health(healthy)
            }
            exit = process.wait_for_exit() => StartOutcome::Exited(exit),
        };

        match outcome {
            StartOutcome::Health(true) => {}
            StartOutcome::Health(false) => {
                let msg = format!(
                    "Health check {} did not pass within {:?}",
                    url, config.health_timeout
                );
                tracing::warn!("'{}': {}", tool_id, msg);
                logs.push(LogSource::System, msg);
                process.terminate(config.stop_grace).await;
                self.fail_start(tool_id, instance_id, process.exit_status().and_then(|e| e.code));
                return Err(ToolError::HealthCheckFailed);
            }
            StartOutcome::Exited(exit) => {
                let msg = format!(
                    "'{}' exited with code {:?} before becoming healthy",
                    tool_id, exit.code
                );
                tracing::warn!("{}", msg);
                logs.push(LogSource::System, msg.clone());
                // 리더만 죽고 남은 자식이 있을 수 있음
                let _ = process::kill_group(process.pid);
                self.fail_start(tool_id, instance_id, exit.code);
                return Err(ToolError::FailedToStart(msg));
            }
        }

        let running = {
            let mut slots = self.slots();
            match slots.get_mut(tool_id) {
                Some(slot) if slot.instance.instance_id == instance_id => {
                    if let Err(e) = slot.instance.transition(ProcessStatus::Running) {
                        tracing::error!("'{}': {}", tool_id, e);
                    }
                    slot.instance.mark_healthy();
                    Some(slot.instance.clone())
                }
                _ => None,
            }
        };
        let Some(running) = running else {
            process.terminate(config.stop_grace).await;
            return Err(ToolError::FailedToStart(format!(
                "'{}' was removed while starting",
                tool_id
            )));
        };

        self.start_health_monitor(tool_id, instance_id, url);
        self.watch_exit(tool_id, instance_id, process);
        logs.push(LogSource::System, format!("'{}' is healthy on port {}", tool_id, port));
        tracing::info!(
            "'{}' running (PID {:?}, port {})",
            tool_id,
            running.pid,
            running.port
        );
        self.notify(tool_id, ProcessStatus::Running);
        Ok(running)
    }

    /// Mark a start attempt as failed and give its port back.
    fn fail_start(&self, tool_id: &str, instance_id: Uuid, exit_code: Option<i32>) {
        let changed = {
            let mut slots = self.slots();
            match slots.get_mut(tool_id) {
                Some(slot) if slot.instance.instance_id == instance_id => {
                    let changed = slot.instance.transition(ProcessStatus::Error).is_ok();
                    slot.instance.exit_code = exit_code;
                    slot.process = None;
                    slot.release_port(&self.inner.ports);
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.notify(tool_id, ProcessStatus::Error);
        }
    }

    fn start_health_monitor(&self, tool_id: &str, instance_id: Uuid, url: String) {
        let weak = Arc::downgrade(&self.inner);
        let key = tool_id.to_string();
        self.inner.health.start_monitoring(
            tool_id,
            url,
            self.inner.config.monitor_interval,
            Arc::new(move |healthy: bool| {
                if let Some(supervisor) = Self::from_weak(&weak) {
                    supervisor.on_health_result(&key, instance_id, healthy);
                }
            }),
        );
    }

    fn watch_exit(&self, tool_id: &str, instance_id: Uuid, process: Arc<ManagedProcess>) {
        let weak = Arc::downgrade(&self.inner);
        let key = tool_id.to_string();
        tokio::spawn(async move {
            let exit = process.wait_for_exit().await;
            if let Some(supervisor) = Self::from_weak(&weak) {
                supervisor.on_process_exit(&key, instance_id, exit);
            }
        });
    }

    /// Running <-> Error on health transitions; every healthy poll refreshes
    /// `last_health_check`.
    fn on_health_result(&self, tool_id: &str, instance_id: Uuid, healthy: bool) {
        let changed = {
            let mut slots = self.slots();
            let slot = match slots.get_mut(tool_id) {
                Some(slot) if slot.instance.instance_id == instance_id => slot,
                _ => return,
            };
            if healthy {
                slot.instance.mark_healthy();
            }
            let target = match (slot.instance.status, healthy) {
                (ProcessStatus::Running, false) => Some(ProcessStatus::Error),
                (ProcessStatus::Error, true) => Some(ProcessStatus::Running),
                _ => None,
            };
            target.filter(|to| slot.instance.transition(*to).is_ok())
        };

        if let Some(status) = changed {
            let msg = if healthy {
                format!("'{}' is healthy again", tool_id)
            } else {
                format!("'{}' failed its health check", tool_id)
            };
            tracing::warn!("{}", msg);
            self.log_buffer(tool_id).push(LogSource::System, msg);
            self.notify(tool_id, status);
        }
    }

    /// Exit of a process that had reached Running. A stop in progress has
    /// already marked the instance Stopped, so this is a crash only if the
    /// instance is still Running or Error.
    fn on_process_exit(&self, tool_id: &str, instance_id: Uuid, exit: ProcessExit) {
        let crashed = {
            let mut slots = self.slots();
            let slot = match slots.get_mut(tool_id) {
                Some(slot) if slot.instance.instance_id == instance_id => slot,
                _ => {
                    tracing::debug!("Ignoring exit of a previous '{}' instance", tool_id);
                    return;
                }
            };
            if !matches!(slot.instance.status, ProcessStatus::Running | ProcessStatus::Error) {
                tracing::debug!(
                    "'{}' exited while {}, not a crash",
                    tool_id,
                    slot.instance.status
                );
                return;
            }
            if let Err(e) = slot.instance.transition(ProcessStatus::Crashed) {
                tracing::error!("'{}': {}", tool_id, e);
                return;
            }
            slot.instance.exit_code = exit.code;
            let pid = slot.process.take().map(|p| p.pid);
            slot.release_port(&self.inner.ports);
            // 새 인스턴스의 모니터를 지우지 않도록 테이블 락 안에서 중지
            self.inner.health.stop_monitoring(tool_id);
            (slot.descriptor.clone(), pid)
        };
        let (descriptor, pid) = crashed;

        let msg = format!("'{}' crashed (exit code {:?})", tool_id, exit.code);
        tracing::warn!("{}", msg);
        self.log_buffer(tool_id).push(LogSource::System, msg);
        // 그룹에 남은 자식 프로세스 정리
        if let Some(pid) = pid {
            let _ = process::kill_group(pid);
        }
        self.notify(tool_id, ProcessStatus::Crashed);

        if self.auto_restart() {
            self.schedule_restart(descriptor, instance_id);
        }
    }

    fn schedule_restart(&self, descriptor: ToolDescriptor, crashed_instance: Uuid) {
        let weak = Arc::downgrade(&self.inner);
        let cooldown = self.inner.config.restart_cooldown;
        tracing::info!("Restarting '{}' in {:?}", descriptor.id, cooldown);

        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let Some(supervisor) = Self::from_weak(&weak) else {
                return;
            };
            if !supervisor.auto_restart() {
                tracing::info!("Auto-restart of '{}' cancelled (disabled)", descriptor.id);
                return;
            }
            // 쿨다운 중에 사용자가 stop/start 했다면 건너뜀
            let still_crashed = supervisor
                .slots()
                .get(&descriptor.id)
                .map(|slot| {
                    slot.instance.instance_id == crashed_instance
                        && slot.instance.status == ProcessStatus::Crashed
                })
                .unwrap_or(false);
            if !still_crashed {
                tracing::debug!("'{}' changed during cooldown, skipping restart", descriptor.id);
                return;
            }

            tracing::info!("Auto-restarting '{}'", descriptor.id);
            match supervisor.start(&descriptor).await {
                Ok(instance) => tracing::info!(
                    "'{}' restarted (PID {:?}, port {})",
                    descriptor.id,
                    instance.pid,
                    instance.port
                ),
                Err(e) => tracing::error!("Auto-restart of '{}' failed: {}", descriptor.id, e),
            }
        });
    }

    /// Stop a tool. Unknown or already-stopped ids are a no-op.
    pub async fn stop(&self, tool_id: &str) -> ToolResult<()> {
        let lock = self.op_lock(tool_id);
        let _guard = lock.lock().await;
        self.stop_locked(tool_id).await;
        Ok(())
    }

    async fn stop_locked(&self, tool_id: &str) {
        self.inner.health.stop_monitoring(tool_id);

        let taken = {
            let mut slots = self.slots();
            slots.get_mut(tool_id).map(|slot| {
                // 종료 감시가 크래시로 오인하지 않도록 신호 전에 Stopped 표시
                let changed = slot.instance.status != ProcessStatus::Stopped
                    && slot.instance.transition(ProcessStatus::Stopped).is_ok();
                (slot.instance.instance_id, slot.process.take(), changed)
            })
        };
        let Some((instance_id, process, changed)) = taken else {
            tracing::debug!("'{}' is not running, nothing to stop", tool_id);
            return;
        };
        if changed {
            self.notify(tool_id, ProcessStatus::Stopped);
        }

        if let Some(process) = process {
            tracing::info!("Stopping '{}' (PID {})", tool_id, process.pid);
            self.log_buffer(tool_id)
                .push(LogSource::System, format!("Stopping '{}'", tool_id));
            if !process.terminate(self.inner.config.stop_grace).await {
                tracing::error!("'{}' (PID {}) may still be running", tool_id, process.pid);
            } else if crate::process_monitor::is_running_async(process.pid).await {
                tracing::warn!("PID {} of '{}' is still listed after exit", process.pid, tool_id);
            }
        }

        let mut slots = self.slots();
        let matches = slots
            .get(tool_id)
            .map(|slot| slot.instance.instance_id == instance_id)
            .unwrap_or(false);
        if matches {
            if let Some(mut slot) = slots.remove(tool_id) {
                slot.release_port(&self.inner.ports);
            }
        }
        tracing::info!("'{}' stopped", tool_id);
    }

    /// Stop, pause briefly, start again.
    pub async fn restart(&self, descriptor: &ToolDescriptor) -> ToolResult<RunningInstance> {
        self.stop(&descriptor.id).await?;
        tokio::time::sleep(self.inner.config.restart_pause).await;
        self.start(descriptor).await
    }

    /// Stop every known instance and cancel all monitors.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.slots().keys().cloned().collect();
        tracing::info!("Stopping {} tool(s)", ids.len());
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!("Failed to stop '{}': {}", id, e);
            }
        }
        self.inner.health.stop_all();
    }

    // ─── queries ────────────────────────────────────────────

    pub fn instance(&self, tool_id: &str) -> Option<RunningInstance> {
        self.slots().get(tool_id).map(|slot| slot.instance.clone())
    }

    /// Status of a tool; a tool with no instance reports `Stopped`.
    pub fn status(&self, tool_id: &str) -> ProcessStatus {
        self.slots()
            .get(tool_id)
            .map(|slot| slot.instance.status)
            .unwrap_or(ProcessStatus::Stopped)
    }

    /// Every known instance, ordered by tool id.
    pub fn statuses(&self) -> Vec<RunningInstance> {
        let mut all: Vec<RunningInstance> =
            self.slots().values().map(|slot| slot.instance.clone()).collect();
        all.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        all
    }

    pub fn is_running(&self, tool_id: &str) -> bool {
        self.status(tool_id) == ProcessStatus::Running
    }

    /// The last `count` log lines of a tool, oldest first.
    pub fn logs(&self, tool_id: &str, count: usize) -> Vec<LogLine> {
        self.existing_log_buffer(tool_id)
            .map(|buf| buf.get_recent(count))
            .unwrap_or_default()
    }

    /// Log lines with id greater than `since`.
    pub fn logs_since(&self, tool_id: &str, since: u64) -> Vec<LogLine> {
        self.existing_log_buffer(tool_id)
            .map(|buf| buf.get_since(since))
            .unwrap_or_default()
    }

    fn existing_log_buffer(&self, tool_id: &str) -> Option<Arc<LogBuffer>> {
        self.inner
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool_id)
            .cloned()
    }
}

/// Start command, plus `<flag> <port>` for dynamic-port tools.
pub(crate) fn compose_command_line(descriptor: &ToolDescriptor, port: u16, port_flag: &str) -> String {
    let command = descriptor.start.command.trim();
    if descriptor.is_dynamic_port() {
        format!("{} {} {}", command, port_flag, port)
    } else {
        command.to_string()
    }
}

/// Base OS environment, then `PORT`, then the descriptor's own variables.
pub(crate) fn compose_environment(descriptor: &ToolDescriptor, port: u16) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert("PORT".to_string(), port.to_string());
    if let Some(overrides) = &descriptor.start.environment {
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::tests::{descriptor_with_port, descriptor_with_range};
    use std::collections::BTreeMap;

    pub(crate) fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            health_timeout: Duration::from_secs(3),
            health_poll_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(100),
            stop_grace: Duration::from_millis(500),
            restart_cooldown: Duration::from_millis(200),
            restart_pause: Duration::from_millis(50),
            log_buffer_lines: 100,
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            auto_restart: false,
        }
    }

    pub(crate) fn supervisor(config: SupervisorConfig) -> ProcessSupervisor {
        ProcessSupervisor::new(config, Arc::new(PortAllocator::default()), HealthChecker::default())
    }

    /// Records every status it is told about.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub seen: Mutex<Vec<(String, ProcessStatus)>>,
    }

    impl StatusObserver for RecordingObserver {
        fn on_status_changed(&self, tool_id: &str, status: ProcessStatus) {
            self.seen.lock().unwrap().push((tool_id.to_string(), status));
        }
    }

    impl RecordingObserver {
        pub fn statuses_for(&self, tool_id: &str) -> Vec<ProcessStatus> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == tool_id)
                .map(|(_, s)| *s)
                .collect()
        }
    }

    #[test]
    fn test_command_line_for_fixed_port() {
        let desc = descriptor_with_port("fixed", 18789);
        assert_eq!(compose_command_line(&desc, 18789, "--port"), "sleep 30");
    }

    #[test]
    fn test_command_line_for_dynamic_port() {
        let desc = descriptor_with_range("dyn", 3000, 3100);
        assert_eq!(compose_command_line(&desc, 3007, "--port"), "sleep 30 --port 3007");
        assert_eq!(compose_command_line(&desc, 3007, "-p"), "sleep 30 -p 3007");
    }

    #[test]
    fn test_environment_layering() {
        let mut desc = descriptor_with_port("env", 18789);
        let mut overrides = BTreeMap::new();
        overrides.insert("PORT".to_string(), "9999".to_string());
        overrides.insert("TOOL_MODE".to_string(), "dev".to_string());
        desc.start.environment = Some(overrides);

        let env = compose_environment(&desc, 18789);
        // 디스크립터 값이 PORT보다 우선
        assert_eq!(env.get("PORT").map(String::as_str), Some("9999"));
        assert_eq!(env.get("TOOL_MODE").map(String::as_str), Some("dev"));
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(env.get("PATH"), Some(&path));
        }

        let plain = compose_environment(&descriptor_with_port("env", 18789), 18789);
        assert_eq!(plain.get("PORT").map(String::as_str), Some("18789"));
    }

    #[test]
    fn test_unknown_tool_queries() {
        let sup = supervisor(fast_config());
        assert_eq!(sup.status("ghost"), ProcessStatus::Stopped);
        assert!(sup.instance("ghost").is_none());
        assert!(!sup.is_running("ghost"));
        assert!(sup.logs("ghost", 10).is_empty());
        assert!(sup.logs_since("ghost", 0).is_empty());
        assert!(sup.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let sup = supervisor(fast_config());
        let observer = Arc::new(RecordingObserver::default());
        sup.add_observer(observer.clone());

        sup.stop("ghost").await.unwrap();
        assert!(observer.seen.lock().unwrap().is_empty());
        assert_eq!(sup.status("ghost"), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_before_anything() {
        let sup = supervisor(fast_config());
        let mut desc = descriptor_with_port("bad", 18789);
        desc.start.command.clear();
        assert!(matches!(sup.start(&desc).await, Err(ToolError::InvalidDescriptor(_))));
        assert!(sup.instance("bad").is_none());
        assert!(sup.ports().reserved().is_empty());
    }

    #[tokio::test]
    async fn test_no_available_port() {
        let sup = supervisor(fast_config());
        let (min, max) = crate::port::tests::free_window(2);
        sup.ports().reserve(min);
        sup.ports().reserve(max);

        let desc = descriptor_with_range("full", min, max);
        assert!(matches!(sup.start(&desc).await, Err(ToolError::NoAvailablePort)));
        assert!(sup.instance("full").is_none());
    }

    #[test]
    fn test_auto_restart_toggle() {
        let sup = supervisor(fast_config());
        assert!(!sup.auto_restart());
        sup.set_auto_restart(true);
        assert!(sup.auto_restart());
    }

    #[cfg(unix)]
    mod process_lifecycle {
        use super::*;
        use crate::health::tests::{dead_port, spawn_health_server};
        use std::sync::atomic::Ordering;

        /// Fixed-port tool whose health lives on a separate in-process server.
        fn tool(id: &str, command: &str, health_port: u16) -> ToolDescriptor {
            let (port, _) = crate::port::tests::free_window(1);
            let mut desc = descriptor_with_port(id, port);
            desc.start.command = command.to_string();
            desc.start.health_check = format!("http://127.0.0.1:{}/health", health_port);
            desc
        }

        async fn wait_for_status(
            sup: &ProcessSupervisor,
            tool_id: &str,
            status: ProcessStatus,
            within: Duration,
        ) -> bool {
            let deadline = std::time::Instant::now() + within;
            while std::time::Instant::now() < deadline {
                if sup.status(tool_id) == status {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }

        #[tokio::test]
        async fn test_start_reaches_running_on_fixed_port() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let desc = tool("fixed", "sleep 60", health_port);
            let fixed = desc.start.port.unwrap();

            let inst = sup.start(&desc).await.unwrap();
            assert_eq!(inst.status, ProcessStatus::Running);
            assert_eq!(inst.port, fixed);
            assert!(inst.pid.is_some());
            assert!(inst.last_health_check.is_some());
            assert!(sup.ports().is_reserved(fixed));
            assert!(sup.health().is_monitoring("fixed"));
            assert!(sup.is_running("fixed"));

            sup.stop("fixed").await.unwrap();
        }

        #[tokio::test]
        async fn test_start_is_idempotent() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let desc = tool("idem", "sleep 60", health_port);

            let first = sup.start(&desc).await.unwrap();
            let second = sup.start(&desc).await.unwrap();
            assert_eq!(first.instance_id, second.instance_id);
            assert_eq!(first.pid, second.pid);
            assert_eq!(sup.statuses().len(), 1);

            sup.stop("idem").await.unwrap();
        }

        #[tokio::test]
        async fn test_concurrent_starts_spawn_once() {
            let (health_port, healthy) = spawn_health_server(false).await;
            let sup = supervisor(fast_config());
            let desc = tool("race", "sleep 60", health_port);

            let flip = healthy.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flip.store(true, Ordering::SeqCst);
            });

            let (a, b) = tokio::join!(sup.start(&desc), sup.start(&desc));
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.instance_id, b.instance_id);

            // 두 번째 호출은 Starting 상태를 그대로 돌려받을 수 있음
            assert!(wait_for_status(&sup, "race", ProcessStatus::Running, Duration::from_secs(3)).await);
            assert_eq!(sup.instance("race").unwrap().pid, a.pid.or(b.pid));
            sup.stop("race").await.unwrap();
        }

        #[tokio::test]
        async fn test_health_failure_releases_port_and_kills_process() {
            let mut config = fast_config();
            config.health_timeout = Duration::from_millis(600);
            let sup = supervisor(config);
            let desc = tool("sick", "sleep 60", dead_port());
            let port = desc.start.port.unwrap();

            let err = sup.start(&desc).await.unwrap_err();
            assert_eq!(err, ToolError::HealthCheckFailed);
            assert!(!sup.ports().is_reserved(port));
            assert!(!sup.health().is_monitoring("sick"));

            let inst = sup.instance("sick").unwrap();
            assert_eq!(inst.status, ProcessStatus::Error);
            let pid = inst.pid.unwrap();
            assert!(!crate::process_monitor::is_running_async(pid).await);

            // 실패한 인스턴스는 다시 시작할 수 있음
            assert!(matches!(sup.start(&desc).await, Err(ToolError::HealthCheckFailed)));
        }

        #[tokio::test]
        async fn test_early_exit_is_failed_to_start() {
            let (health_port, _) = spawn_health_server(false).await;
            let sup = supervisor(fast_config());
            let desc = tool("quitter", "exit 7", health_port);
            let port = desc.start.port.unwrap();

            let err = sup.start(&desc).await.unwrap_err();
            assert!(matches!(err, ToolError::FailedToStart(_)), "{:?}", err);
            let inst = sup.instance("quitter").unwrap();
            assert_eq!(inst.status, ProcessStatus::Error);
            assert_eq!(inst.exit_code, Some(7));
            assert!(!sup.ports().is_reserved(port));
        }

        #[tokio::test]
        async fn test_spawn_failure_releases_port() {
            let sup = supervisor(fast_config());
            let mut desc = tool("nowhere", "sleep 60", dead_port());
            desc.start.working_directory = Some("/definitely/not/here".to_string());
            let port = desc.start.port.unwrap();

            assert!(matches!(sup.start(&desc).await, Err(ToolError::FailedToStart(_))));
            assert!(!sup.ports().is_reserved(port));
            assert_eq!(sup.status("nowhere"), ProcessStatus::Error);
        }

        #[tokio::test]
        async fn test_stop_is_never_reported_as_crash() {
            let (health_port, _) = spawn_health_server(true).await;
            let mut config = fast_config();
            config.auto_restart = true;
            let sup = supervisor(config);
            let observer = Arc::new(RecordingObserver::default());
            sup.add_observer(observer.clone());

            let desc = tool("calm", "sleep 60", health_port);
            let port = desc.start.port.unwrap();
            let pid = sup.start(&desc).await.unwrap().pid.unwrap();
            sup.stop("calm").await.unwrap();

            // 종료 감시와 재시작 쿨다운이 지나갈 시간
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(
                observer.statuses_for("calm"),
                vec![ProcessStatus::Starting, ProcessStatus::Running, ProcessStatus::Stopped]
            );
            assert_eq!(sup.status("calm"), ProcessStatus::Stopped);
            assert!(sup.instance("calm").is_none());
            assert!(!sup.ports().is_reserved(port));
            assert!(!sup.health().is_monitoring("calm"));
            assert!(!crate::process_monitor::is_running_async(pid).await);
        }

        #[tokio::test]
        async fn test_crash_without_auto_restart() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let desc = tool("fragile", "sleep 60", health_port);
            let port = desc.start.port.unwrap();
            let pid = sup.start(&desc).await.unwrap().pid.unwrap();

            process::kill_group(pid).unwrap();
            assert!(wait_for_status(&sup, "fragile", ProcessStatus::Crashed, Duration::from_secs(3)).await);
            assert!(!sup.ports().is_reserved(port));
            assert!(!sup.health().is_monitoring("fragile"));
            assert_eq!(sup.instance("fragile").unwrap().exit_code, None);

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(sup.status("fragile"), ProcessStatus::Crashed);

            // 크래시 후 stop은 정리만 함
            sup.stop("fragile").await.unwrap();
            assert!(sup.instance("fragile").is_none());
        }

        #[tokio::test]
        async fn test_crash_with_auto_restart_gets_new_process() {
            let (health_port, _) = spawn_health_server(true).await;
            let mut config = fast_config();
            config.auto_restart = true;
            let sup = supervisor(config);
            let observer = Arc::new(RecordingObserver::default());
            sup.add_observer(observer.clone());

            let desc = tool("phoenix", "sleep 60", health_port);
            let first = sup.start(&desc).await.unwrap();
            process::kill_group(first.pid.unwrap()).unwrap();

            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let restarted = loop {
                if let Some(inst) = sup.instance("phoenix") {
                    if inst.status == ProcessStatus::Running && inst.instance_id != first.instance_id {
                        break inst;
                    }
                }
                assert!(std::time::Instant::now() < deadline, "tool was not restarted");
                tokio::time::sleep(Duration::from_millis(20)).await;
            };
            assert_ne!(restarted.pid, first.pid);
            assert!(observer.statuses_for("phoenix").contains(&ProcessStatus::Crashed));

            sup.stop("phoenix").await.unwrap();
        }

        #[tokio::test]
        async fn test_health_degradation_and_recovery() {
            let (health_port, healthy) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let desc = tool("flaky", "sleep 60", health_port);
            sup.start(&desc).await.unwrap();

            healthy.store(false, Ordering::SeqCst);
            assert!(wait_for_status(&sup, "flaky", ProcessStatus::Error, Duration::from_secs(2)).await);
            // Error 상태(프로세스 살아 있음)에서 start는 기존 인스턴스를 반환
            let same = sup.start(&desc).await.unwrap();
            assert_eq!(same.status, ProcessStatus::Error);

            healthy.store(true, Ordering::SeqCst);
            assert!(wait_for_status(&sup, "flaky", ProcessStatus::Running, Duration::from_secs(2)).await);

            sup.stop("flaky").await.unwrap();
        }

        #[tokio::test]
        async fn test_restart_gives_new_process() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let desc = tool("again", "sleep 60", health_port);

            let first = sup.start(&desc).await.unwrap();
            let second = sup.restart(&desc).await.unwrap();
            assert_ne!(first.instance_id, second.instance_id);
            assert_ne!(first.pid, second.pid);
            assert_eq!(second.status, ProcessStatus::Running);

            sup.stop("again").await.unwrap();
        }

        #[tokio::test]
        async fn test_dynamic_port_is_passed_to_the_process() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            let (min, max) = crate::port::tests::free_window(3);
            let mut desc = descriptor_with_range("dyn", min, max);
            desc.start.command = r#"sh -c 'echo "arg=$1 env=$PORT"; sleep 60'"#.to_string();
            desc.start.health_check = format!("http://127.0.0.1:{}/health", health_port);

            let inst = sup.start(&desc).await.unwrap();
            assert!((min..=max).contains(&inst.port));

            let expected = format!("arg={} env={}", inst.port, inst.port);
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            loop {
                let lines = sup.logs("dyn", 50);
                if lines.iter().any(|l| l.source == LogSource::Stdout && l.content == expected) {
                    break;
                }
                assert!(std::time::Instant::now() < deadline, "{:?}", lines);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            sup.stop("dyn").await.unwrap();
        }

        #[tokio::test]
        async fn test_stop_all() {
            let (health_port, _) = spawn_health_server(true).await;
            let sup = supervisor(fast_config());
            sup.start(&tool("one", "sleep 60", health_port)).await.unwrap();
            sup.start(&tool("two", "sleep 60", health_port)).await.unwrap();
            assert_eq!(sup.statuses().len(), 2);

            sup.stop_all().await;
            assert!(sup.statuses().is_empty());
            assert!(sup.health().monitored_keys().is_empty());
            assert!(sup.ports().reserved().is_empty());
        }
    }
}
