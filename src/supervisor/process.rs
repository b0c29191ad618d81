use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("failed to signal process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Ask the process group led by `pid` to exit (SIGTERM).
///
/// A group that is already gone counts as success.
pub fn terminate_group(pid: u32) -> Result<(), SignalError> {
    send(pid, false)
}

/// Kill the process group led by `pid` outright (SIGKILL).
pub fn kill_group(pid: u32) -> Result<(), SignalError> {
    send(pid, true)
}

#[cfg(not(target_os = "windows"))]
fn send(pid: u32, force: bool) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    tracing::debug!("Sending {:?} to process group {}", signal, pid);

    // 자식은 process_group(0)으로 띄우므로 pgid == pid
    match signal::killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => {
            // 그룹 신호가 거부되면 리더에게만 시도
            tracing::warn!("killpg({}) failed: {}, signalling the leader only", pid, e);
            match signal::kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(SignalError::Failed {
                    pid,
                    reason: e.to_string(),
                }),
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn send(pid: u32, force: bool) -> Result<(), SignalError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    // Windows에는 SIGTERM이 없으므로 둘 다 즉시 종료
    let exit_code = if force { 1 } else { 0 };
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            // 이미 종료된 프로세스
            return Ok(());
        }
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            return Err(SignalError::Failed {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}
