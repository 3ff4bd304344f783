//! VMM process management.
//!
//! Wraps the spawned firecracker child with signal handling and graceful
//! shutdown. The serial console rides on the child's stdio, so the handle
//! hands its pipes to the serial bridge at boot.

use std::process::Child;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Grace period between SIGTERM and SIGKILL when stopping a VMM.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a terminating process.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process is alive.
///
/// Used at recovery time against pids read from descriptors; the process
/// is not our child there, so `kill(pid, 0)` is the only portable probe.
pub fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// A handle to a running VMM child process.
#[derive(Debug)]
pub struct VmmProcess {
    child: Child,
    exit_code: Option<i32>,
}

impl VmmProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exit_code: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Take the child's stdin pipe (for the serial bridge).
    pub fn take_stdin(&mut self) -> Option<std::process::ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the child's stdout pipe (for the serial bridge).
    pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Check if the process is still running, reaping it if it exited.
    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// Non-blocking exit check. Returns the exit code once the process
    /// has been reaped.
    pub fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(_) => {
                // waitpid failed; treat as gone
                self.exit_code = Some(-1);
                self.exit_code
            }
        }
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> bool {
        unsafe { libc::kill(self.pid(), libc::SIGTERM) == 0 }
    }

    /// Gracefully stop the process.
    ///
    /// Sends SIGTERM, waits up to `grace`, then SIGKILLs and reaps.
    /// Returns the exit code.
    pub fn stop(&mut self, grace: Duration) -> Result<i32> {
        if let Some(code) = self.poll_exit() {
            return Ok(code);
        }

        if !self.terminate() {
            // Signal failed: the process is already gone.
            return Ok(self.poll_exit().unwrap_or(0));
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(code) = self.poll_exit() {
                return Ok(code);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        tracing::debug!(pid = self.pid(), "SIGTERM grace expired, sending SIGKILL");
        let _ = self.child.kill();
        let status = self.child.wait()?;
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        Ok(code)
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_is_alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        // PID 99999999 is unlikely to exist
        assert!(!is_alive(99999999));
    }

    #[test]
    fn test_poll_exit_reaps_child() {
        let child = Command::new("true").spawn().unwrap();
        let mut proc = VmmProcess::new(child);

        // Wait for the child to exit, then poll must report code 0.
        let start = Instant::now();
        loop {
            if let Some(code) = proc.poll_exit() {
                assert_eq!(code, 0);
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!proc.is_running());
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        // A child that ignores SIGTERM must still die within the grace path.
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 60"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut proc = VmmProcess::new(child);

        let code = proc.stop(Duration::from_millis(300)).unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
        assert!(!proc.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let child = Command::new("true").spawn().unwrap();
        let mut proc = VmmProcess::new(child);
        let first = proc.stop(Duration::from_secs(1)).unwrap();
        let second = proc.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(first, second);
    }
}
