//! Process liveness probes.

use std::collections::HashSet;
use std::io;
use std::sync::Mutex;

use crate::ports::ProcessProbe;

/// Probes with `kill(pid, 0)`.
///
/// Success or `EPERM` means the process exists. Only `ESRCH` proves it is
/// gone; every other error is treated as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs the permission and existence checks
            // without delivering anything.
            let result = unsafe { libc::kill(pid, 0) };
            if result == 0 {
                return true;
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            errno != libc::ESRCH
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }
}

/// Probe with an explicit set of live pids.
#[derive(Debug, Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn new(alive: impl IntoIterator<Item = u32>) -> Self {
        Self {
            alive: Mutex::new(alive.into_iter().collect()),
        }
    }

    pub fn kill(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    pub fn spawn(&self, pid: u32) {
        self.lock().insert(pid);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.alive.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }
}
