//! Process identity resolution and termination

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, warn};

/// How long to wait for a killed process to actually exit. Delivery of the
/// signal, not exit, is what `terminate` guarantees; the wait is best effort.
const EXIT_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_WAIT_ROUNDS: u32 = 5;

/// Process control errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process not found: {0}")]
    ProcessNotFound(i32),

    #[error("Permission denied terminating process {0}")]
    PermissionDenied(i32),

    #[error("Failed to terminate process {0}")]
    TerminationFailed(i32),
}

/// Resolves process names and terminates processes on request
pub struct ProcessController {
    system: Mutex<System>,
}

impl ProcessController {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best-effort name lookup; absence is not an error
    pub fn resolve_name(&self, pid: i32) -> Option<String> {
        let target = Pid::from_u32(pid as u32);
        let mut system = self.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system
            .process(target)
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    /// Deliver a termination request to the OS
    ///
    /// Waits a bounded interval for the process to exit, then reports success
    /// anyway once the signal was delivered; synchronous exit is not guaranteed.
    pub fn terminate(&self, pid: i32) -> Result<(), ProcessError> {
        let target = Pid::from_u32(pid as u32);
        let mut system = self.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let process = system
            .process(target)
            .ok_or(ProcessError::ProcessNotFound(pid))?;

        if !process.kill() {
            // The kernel refused the signal. A target owned by another user is
            // the permission case; anything else is a plain delivery failure.
            let foreign_owner = sysinfo::get_current_pid()
                .ok()
                .and_then(|me| {
                    let my_uid = system.process(me)?.user_id()?;
                    let their_uid = system.process(target)?.user_id()?;
                    Some(my_uid != their_uid)
                })
                .unwrap_or(false);

            return if foreign_owner {
                warn!(pid, "Termination refused: process owned by another user");
                Err(ProcessError::PermissionDenied(pid))
            } else {
                warn!(pid, "Termination signal could not be delivered");
                Err(ProcessError::TerminationFailed(pid))
            };
        }

        for _ in 0..EXIT_WAIT_ROUNDS {
            std::thread::sleep(EXIT_WAIT_INTERVAL);
            if system.refresh_processes(ProcessesToUpdate::Some(&[target]), true) == 0 {
                debug!(pid, "Process exited after termination signal");
                return Ok(());
            }
        }

        debug!(pid, "Termination signal delivered; process has not exited yet");
        Ok(())
    }
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}
