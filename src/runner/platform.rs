//! Platform plumbing for child processes: process-group placement and
//! signal delivery, so a kill reliably reaches the whole subtree.

#[cfg(unix)]
pub use self::unix::{kill, prepare, terminate};

#[cfg(windows)]
pub use self::windows::{kill, prepare, terminate};

#[cfg(unix)]
mod unix {
    use nix::sys::signal::{kill as send_signal, Signal};
    use nix::unistd::{getpgid, setpgid, Pid};
    use tokio::process::Command;

    use crate::error::{Error, Result};

    /// Place the child in its own process group so signals can target the
    /// whole subtree.
    pub fn prepare(cmd: &mut Command) {
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }
    }

    /// Polite termination: SIGTERM to the process group.
    pub fn terminate(pid: u32) -> Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    /// Unconditional kill of the process group.
    pub fn kill(pid: u32) -> Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }

    fn signal_group(pid: u32, signal: Signal) -> Result<()> {
        let raw: i32 = pid.try_into().map_err(|_| Error::SignalFailed {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        // When the child leads its own group, a negative pid reaches every
        // member; otherwise fall back to the single process.
        let target = match getpgid(Some(Pid::from_raw(raw))) {
            Ok(pgid) if pgid == Pid::from_raw(raw) => Pid::from_raw(-raw),
            _ => Pid::from_raw(raw),
        };
        send_signal(target, signal).map_err(|e| Error::SignalFailed {
            pid,
            reason: format!("{:?}: {}", signal, e),
        })
    }
}

#[cfg(windows)]
mod windows {
    use std::os::windows::process::CommandExt;

    use tokio::process::Command;
    use winapi::shared::minwindef::FALSE;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::winbase::{
        CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT,
    };
    use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    use crate::error::{Error, Result};

    /// New process group so CTRL_BREAK can target it; the group id equals
    /// the child pid.
    pub fn prepare(cmd: &mut Command) {
        cmd.creation_flags(CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_PROCESS_GROUP);
    }

    /// Polite termination: CTRL_BREAK to the child's process group.
    pub fn terminate(pid: u32) -> Result<()> {
        let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        if ok == FALSE {
            let err = unsafe { GetLastError() };
            return Err(Error::SignalFailed {
                pid,
                reason: format!("GenerateConsoleCtrlEvent failed: {}", err),
            });
        }
        Ok(())
    }

    /// Unconditional kill of the whole process tree.
    pub fn kill(pid: u32) -> Result<()> {
        let output = std::process::Command::new("taskkill.exe")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| Error::SignalFailed {
                pid,
                reason: format!("taskkill spawn failed: {}", e),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::SignalFailed {
                pid,
                reason: if stderr.is_empty() {
                    "taskkill failed".to_string()
                } else {
                    stderr
                },
            });
        }
        Ok(())
    }
}
