//! Platform execution backend.
//!
//! Two seams live here:
//! - page-level memory primitives used by [`crate::code::region`]
//!   (allocate read+write, flip to read+execute, flush the instruction cache,
//!   release), selected at build time;
//! - the [`ProcessControl`] trait the sandbox controller drives to create
//!   limit containers, spawn children and read their resource usage.
//!
//! Platform enforcement:
//! - Unix: `mmap`/`mprotect`, `setrlimit` applied in the child between fork and exec
//! - Windows: `VirtualAlloc`/`VirtualProtect`, Job Objects attached to a suspended child

use std::io;
use std::process::ExitStatus;

use serde::Serialize;

use crate::sandbox::{SandboxLimits, SpawnPlan};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as native;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as native;

pub use native::{LimitContainer, NativeBackend};
pub(crate) use native::{alloc_writable, flush_icache, page_size, protect_exec, release};

/// How a sandboxed child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number (Unix only).
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Killed by a signal, or exited without a code.
    pub fn is_abnormal(&self) -> bool {
        self.signal.is_some() || self.code.is_none()
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }

        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

/// A child process owned by a sandbox.
pub trait SandboxProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking poll; `None` while the child is still running.
    fn try_wait(&mut self) -> io::Result<Option<ExitReport>>;

    /// Forcefully terminate the child.
    fn kill(&mut self) -> io::Result<()>;

    /// Block until the child has exited and release its OS resources.
    fn wait(&mut self) -> io::Result<ExitReport>;
}

/// Process-side operations the sandbox controller needs from the OS.
pub trait ProcessControl: Send + Sync {
    /// Pre-allocate a resource-limiting container for `limits`.
    ///
    /// Returns `Ok(None)` on platforms that apply limits per process instead.
    fn create_container(&self, limits: &SandboxLimits) -> io::Result<Option<LimitContainer>>;

    /// Run `command` through the platform shell with `plan` applied before
    /// the command starts doing work.
    fn spawn(
        &self,
        command: &str,
        plan: &SpawnPlan,
        container: Option<&LimitContainer>,
    ) -> io::Result<Box<dyn SandboxProcess>>;

    /// Resident/working-set size in bytes, `0` when unknown.
    fn memory_usage(&self, pid: u32) -> u64;

    /// Accumulated user+kernel CPU time in milliseconds, `0` when unknown.
    fn cpu_time_ms(&self, pid: u32) -> u64;
}

/// Round `len` up to a whole number of pages.
pub(crate) fn page_align(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n / page * page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_up() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_align(1), Some(page));
        assert_eq!(page_align(page), Some(page));
        assert_eq!(page_align(page + 1), Some(page * 2));
        assert_eq!(page_align(usize::MAX), None);
    }

    #[test]
    fn exit_report_classification() {
        let ok = ExitReport {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        assert!(!ok.is_abnormal());

        let killed = ExitReport {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.success());
        assert!(killed.is_abnormal());
    }
}
