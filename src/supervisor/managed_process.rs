//! Managed Process - shell spawning with combined stdout/stderr capture
//!
//! Each tool process is started through the platform shell in its own
//! process group, its output lines land in a per-tool rolling buffer, and
//! its exit is published on a watch channel.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use super::process;
use crate::utils::current_timestamp;

/// Default number of lines kept per tool.
pub const DEFAULT_LOG_BUFFER: usize = 1000;

/// SIGKILL 이후 종료 확인 대기 시간
const KILL_WAIT: Duration = Duration::from_secs(5);

// ─── Log Types ───────────────────────────────────────────────

/// A single line of console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`GET /logs?since=<id>`), starting at 1
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages written by the supervisor itself
    System,
}

// ─── Log Buffer ──────────────────────────────────────────────

struct LogRing {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

/// Rolling buffer of recent lines with sequential IDs.
///
/// One buffer lives per tool id and outlives individual processes, so
/// output from before a restart stays readable.
pub struct LogBuffer {
    ring: Mutex<LogRing>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER)
    }
}

impl LogBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            ring: Mutex::new(LogRing {
                lines: VecDeque::with_capacity(max_size.min(DEFAULT_LOG_BUFFER)),
                next_id: 1,
                max_size,
            }),
        }
    }

    fn ring(&self) -> MutexGuard<'_, LogRing> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a new log line and return it.
    pub fn push(&self, source: LogSource, content: impl Into<String>) -> LogLine {
        let mut ring = self.ring();
        let line = LogLine {
            id: ring.next_id,
            timestamp: current_timestamp(),
            source,
            content: content.into(),
        };
        ring.next_id += 1;

        if ring.lines.len() >= ring.max_size {
            ring.lines.pop_front();
        }
        ring.lines.push_back(line.clone());
        line
    }

    /// All buffered lines with id > `since_id`.
    pub fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.ring()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        let ring = self.ring();
        let skip = ring.lines.len().saturating_sub(count);
        ring.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// What to run and in which environment.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub command_line: String,
    /// Complete environment of the child (the parent's is not inherited).
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal or could not be waited on.
    pub code: Option<i32>,
}

/// A tool process spawned by the supervisor.
pub struct ManagedProcess {
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// Spawn `options.command_line` through the shell.
    ///
    /// Must be called from within a tokio runtime. Reader tasks feed `logs`
    /// until the pipes close; a waiter task publishes the exit.
    pub fn spawn(options: &SpawnOptions, logs: Arc<LogBuffer>) -> std::io::Result<Self> {
        let mut cmd = crate::utils::shell_command(&options.command_line);
        cmd.env_clear()
            .envs(&options.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        // 프로세스 그룹 리더로 띄워서 종료 시 손자 프로세스까지 신호 전달
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no PID")
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let buf = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buf.push(LogSource::Stdout, line);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            let buf = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buf.push(LogSource::Stderr, line);
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let buf = logs.clone();
            tokio::spawn(async move {
                let (exit, msg) = match child.wait().await {
                    Ok(status) => (
                        ProcessExit { code: status.code() },
                        format!("Process {} exited with {}", pid, status),
                    ),
                    Err(e) => (
                        ProcessExit { code: None },
                        format!("Failed to wait for process {}: {}", pid, e),
                    ),
                };
                tracing::info!("{}", msg);
                buf.push(LogSource::System, msg);
                let _ = exit_tx.send(Some(exit));
            });
        }

        logs.push(LogSource::System, format!("Process started with PID {}", pid));

        Ok(Self { pid, exit_rx })
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Resolves once the process has exited; immediately if it already has.
    pub async fn wait_for_exit(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit { code: None }),
            // 대기 태스크가 사라졌다면 종료된 것으로 간주
            Err(_) => ProcessExit { code: None },
        };
        exit
    }

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    ///
    /// Returns whether the process was observed to exit.
    pub async fn terminate(&self, grace: Duration) -> bool {
        if self.has_exited() {
            return true;
        }

        if let Err(e) = process::terminate_group(self.pid) {
            tracing::warn!("{}", e);
        }
        if tokio::time::timeout(grace, self.wait_for_exit()).await.is_ok() {
            return true;
        }

        tracing::warn!(
            "Process {} did not exit within {:?}, sending SIGKILL",
            self.pid,
            grace
        );
        if let Err(e) = process::kill_group(self.pid) {
            tracing::error!("{}", e);
        }
        match tokio::time::timeout(KILL_WAIT, self.wait_for_exit()).await {
            Ok(_) => true,
            Err(_) => {
                tracing::error!("Process {} survived SIGKILL", self.pid);
                false
            }
        }
    }
}
