use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::limits::{SandboxLimits, SandboxMode, prepare};
use crate::code::{self, ExecutableRegion};
use crate::error::{Error, Result};
use crate::platform::{ExitReport, LimitContainer, NativeBackend, ProcessControl, SandboxProcess};

/// Externally visible run state; `as i32` gives the classic `0`/`1` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum SandboxStatus {
    Idle = 0,
    Running = 1,
}

impl SandboxStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Point-in-time view of a sandbox, for callers that log or print it.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxReport {
    pub mode: SandboxMode,
    pub limits: SandboxLimits,
    pub pid: u32,
    pub status: SandboxStatus,
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub last_exit: Option<ExitReport>,
    pub last_result: Option<i32>,
}

struct Descriptor {
    mode: SandboxMode,
    limits: SandboxLimits,
    pid: u32,
    status: SandboxStatus,
    container: Option<LimitContainer>,
    process: Option<Box<dyn SandboxProcess>>,
    code: Option<ExecutableRegion>,
    last_exit: Option<ExitReport>,
    last_result: Option<i32>,
    destroyed: bool,
}

impl Descriptor {
    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Reap a child that exited on its own.
    fn refresh(&mut self) {
        if self.status != SandboxStatus::Running {
            return;
        }
        let Some(process) = self.process.as_mut() else {
            return;
        };
        match process.try_wait() {
            Ok(Some(report)) => {
                info!("Sandboxed process {} exited: {:?}", self.pid, report);
                self.last_exit = Some(report);
                self.process = None;
                self.status = SandboxStatus::Idle;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to poll sandboxed process {}: {}", self.pid, e),
        }
    }

    fn live_pid(&mut self) -> u32 {
        self.refresh();
        if self.process.is_some() { self.pid } else { 0 }
    }
}

/// A resource-limited execution context.
///
/// Runs either one shell command at a time in a child process, or (in
/// [`SandboxMode::Vm`]) raw machine code inside the calling process. All
/// operations lock an internal mutex, so a `Sandbox` can be shared between
/// threads.
pub struct Sandbox {
    backend: Box<dyn ProcessControl>,
    state: Mutex<Descriptor>,
}

impl Sandbox {
    /// Create a sandbox on the native platform backend.
    pub fn create(mode: SandboxMode, limits: SandboxLimits) -> Result<Self> {
        Self::with_backend(mode, limits, Box::new(NativeBackend))
    }

    pub fn with_backend(
        mode: SandboxMode,
        limits: SandboxLimits,
        backend: Box<dyn ProcessControl>,
    ) -> Result<Self> {
        let container = if mode.uses_container() {
            backend.create_container(&limits).map_err(Error::Container)?
        } else {
            None
        };
        debug!(
            "Created {} sandbox (container: {}, limits: {:?})",
            mode,
            container.is_some(),
            limits
        );

        Ok(Self {
            backend,
            state: Mutex::new(Descriptor {
                mode,
                limits,
                pid: 0,
                status: SandboxStatus::Idle,
                container,
                process: None,
                code: None,
                last_exit: None,
                last_result: None,
                destroyed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Descriptor> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `command` through the platform shell and return its pid.
    ///
    /// Does not wait for the command. Limits are applied before the command
    /// runs; limits the platform rejects are skipped.
    pub fn exec(&self, command: &str) -> Result<u32> {
        let mut d = self.lock();
        d.ensure_alive()?;
        d.refresh();
        if d.status == SandboxStatus::Running {
            return Err(Error::AlreadyRunning);
        }

        let plan = prepare(&d.limits);
        let process = self
            .backend
            .spawn(command, &plan, d.container.as_ref())
            .map_err(Error::Spawn)?;

        let pid = process.pid();
        d.pid = pid;
        d.process = Some(process);
        d.last_exit = None;
        d.status = SandboxStatus::Running;
        info!("Sandbox ({}) running {:?} as pid {}", d.mode, command, pid);

        Ok(pid)
    }

    /// Load `bytes` through the W^X pipeline and call it in this thread as
    /// `int entry(int argc, char **argv)` with `(0, [NULL])`.
    ///
    /// Only valid in [`SandboxMode::Vm`]. There is no isolation from the
    /// host and no timeout: code that never returns blocks this call (and
    /// the sandbox's lock) forever.
    pub fn exec_code(&self, bytes: &[u8]) -> Result<i32> {
        let mut d = self.lock();
        d.ensure_alive()?;
        if d.mode != SandboxMode::Vm {
            return Err(Error::UnsupportedMode {
                operation: "exec_code",
                mode: d.mode,
            });
        }
        d.refresh();
        if d.process.is_some() {
            return Err(Error::AlreadyRunning);
        }

        // The descriptor only changes once the new code has run.
        let region = code::load(bytes)?;
        let result = code::invoke(&region, None)?;
        debug!("VM code returned {}", result);

        d.code = Some(region);
        d.last_result = Some(result);
        d.status = SandboxStatus::Running;

        Ok(result)
    }

    /// Terminate the running command (or, for VM code, just mark idle).
    ///
    /// The pid is kept for introspection.
    pub fn stop(&self) -> Result<()> {
        let mut d = self.lock();
        d.ensure_alive()?;
        d.refresh();
        if d.status != SandboxStatus::Running {
            return Err(Error::NotRunning);
        }

        if let Some(mut process) = d.process.take() {
            if let Err(e) = process.kill() {
                d.process = Some(process);
                return Err(Error::Process(e));
            }
            let report = match process.wait() {
                Ok(report) => report,
                Err(e) => {
                    // Killed but not reaped; nothing is left to stop.
                    d.status = SandboxStatus::Idle;
                    return Err(Error::Process(e));
                }
            };
            info!("Stopped sandboxed process {}: {:?}", d.pid, report);
            d.last_exit = Some(report);
        }
        d.status = SandboxStatus::Idle;

        Ok(())
    }

    /// Release every OS resource held by the sandbox.
    ///
    /// A still-running command is killed and reaped. Later calls, including
    /// a second `destroy`, fail with [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let mut d = self.lock();
        d.ensure_alive()?;
        Self::teardown(&mut d);
        Ok(())
    }

    fn teardown(d: &mut Descriptor) {
        if let Some(mut process) = d.process.take() {
            match process.try_wait() {
                Ok(Some(report)) => d.last_exit = Some(report),
                _ => {
                    if let Err(e) = process.kill() {
                        warn!("Failed to kill sandboxed process {}: {}", d.pid, e);
                    }
                    match process.wait() {
                        Ok(report) => d.last_exit = Some(report),
                        Err(e) => warn!("Failed to reap sandboxed process {}: {}", d.pid, e),
                    }
                }
            }
        }
        d.container = None;
        d.code = None;
        d.pid = 0;
        d.status = SandboxStatus::Idle;
        d.destroyed = true;
        debug!("Sandbox ({}) destroyed", d.mode);
    }

    /// Current status; notices a command that exited on its own.
    pub fn status(&self) -> SandboxStatus {
        let mut d = self.lock();
        d.refresh();
        d.status
    }

    /// Resident memory of the running command in bytes, `0` if unknown.
    pub fn memory(&self) -> u64 {
        let pid = self.lock().live_pid();
        if pid == 0 { 0 } else { self.backend.memory_usage(pid) }
    }

    /// CPU time of the running command in milliseconds, `0` if unknown.
    pub fn cpu_time(&self) -> u64 {
        let pid = self.lock().live_pid();
        if pid == 0 { 0 } else { self.backend.cpu_time_ms(pid) }
    }

    pub fn mode(&self) -> SandboxMode {
        self.lock().mode
    }

    pub fn limits(&self) -> SandboxLimits {
        self.lock().limits
    }

    /// Pid of the last spawned command, `0` if none or destroyed.
    pub fn pid(&self) -> u32 {
        self.lock().pid
    }

    pub fn last_exit(&self) -> Option<ExitReport> {
        let mut d = self.lock();
        d.refresh();
        d.last_exit
    }

    /// Return value of the last VM-mode call.
    pub fn last_result(&self) -> Option<i32> {
        self.lock().last_result
    }

    pub fn has_container(&self) -> bool {
        self.lock().container.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn report(&self) -> SandboxReport {
        let status = self.status();
        let (memory_bytes, cpu_time_ms) = (self.memory(), self.cpu_time());
        let d = self.lock();
        SandboxReport {
            mode: d.mode,
            limits: d.limits,
            pid: d.pid,
            status,
            memory_bytes,
            cpu_time_ms,
            last_exit: d.last_exit,
            last_result: d.last_result,
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let d = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !d.destroyed {
            Self::teardown(d);
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.lock();
        f.debug_struct("Sandbox")
            .field("mode", &d.mode)
            .field("limits", &d.limits)
            .field("pid", &d.pid)
            .field("status", &d.status)
            .field("destroyed", &d.destroyed)
            .finish()
    }
}


#[cfg(all(test, unix))]
mod native_tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_idle(sandbox: &Sandbox, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if sandbox.status() == SandboxStatus::Idle {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn short_command_runs_to_completion() {
        let sandbox = Sandbox::create(SandboxMode::Process, SandboxLimits::default()).unwrap();
        let pid = sandbox.exec("true").unwrap();
        assert!(pid > 0);

        assert!(wait_idle(&sandbox, Duration::from_secs(5)));
        assert!(sandbox.last_exit().unwrap().success());
        assert_eq!(sandbox.pid(), pid);
    }

    #[test]
    fn stop_terminates_long_command() {
        let sandbox = Sandbox::create(SandboxMode::Restricted, SandboxLimits::default()).unwrap();
        let pid = sandbox.exec("sleep 5").unwrap();
        assert_eq!(sandbox.status(), SandboxStatus::Running);

        sandbox.stop().unwrap();
        assert_eq!(sandbox.status(), SandboxStatus::Idle);
        assert_eq!(sandbox.pid(), pid);
        assert!(sandbox.last_exit().unwrap().is_abnormal());

        sandbox.destroy().unwrap();
        assert!(matches!(sandbox.destroy(), Err(Error::Destroyed)));
    }

    #[test]
    fn repeated_create_destroy_cycles() {
        for _ in 0..100 {
            let sandbox = Sandbox::create(SandboxMode::Process, SandboxLimits::default()).unwrap();
            sandbox.destroy().unwrap();
        }
    }

    #[test]
    fn drop_reaps_running_child() {
        let sandbox = Sandbox::create(SandboxMode::None, SandboxLimits::default()).unwrap();
        let pid = sandbox.exec("sleep 5").unwrap();
        drop(sandbox);

        // The pid no longer names a live child of ours.
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        assert!(!alive);
    }

    #[test]
    fn cpu_limit_stops_busy_loop() {
        let limits = SandboxLimits {
            max_cpu_time: 200,
            ..Default::default()
        };
        let sandbox = Sandbox::create(SandboxMode::Restricted, limits).unwrap();
        sandbox.exec("while :; do :; done").unwrap();

        assert!(wait_idle(&sandbox, Duration::from_secs(15)));
        let exit = sandbox.last_exit().unwrap();
        assert!(exit.is_abnormal(), "exit: {:?}", exit);
    }

    #[test]
    fn stopped_sandbox_accepts_new_command() {
        let sandbox = Sandbox::create(SandboxMode::Process, SandboxLimits::default()).unwrap();
        let first = sandbox.exec("sleep 5").unwrap();
        sandbox.stop().unwrap();

        let second = sandbox.exec("exit 4").unwrap();
        assert_ne!(first, second);
        assert!(wait_idle(&sandbox, Duration::from_secs(5)));
        assert_eq!(sandbox.last_exit().unwrap().code, Some(4));
        assert_eq!(sandbox.pid(), second);
        sandbox.destroy().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn memory_limit_stops_greedy_command() {
        let limits = SandboxLimits {
            max_memory: 64 * 1024 * 1024,
            ..Default::default()
        };
        let sandbox = Sandbox::create(SandboxMode::Restricted, limits).unwrap();
        sandbox
            .exec("x=$(head -c 268435456 /dev/zero | tr '\\0' a); echo ${#x}")
            .unwrap();

        assert!(wait_idle(&sandbox, Duration::from_secs(30)));
        assert!(!sandbox.last_exit().unwrap().success());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn vm_mode_runs_native_code() {
        #[cfg(target_arch = "x86_64")]
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        #[cfg(target_arch = "aarch64")]
        let code = [0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6];

        let sandbox = Sandbox::create(SandboxMode::Vm, SandboxLimits::default()).unwrap();
        assert!(!sandbox.has_container());
        assert_eq!(sandbox.exec_code(&code).unwrap(), 42);
        sandbox.destroy().unwrap();
    }
}
