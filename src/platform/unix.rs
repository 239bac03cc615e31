use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use nix::sys::resource::{Resource, setrlimit};
use tracing::debug;

use super::{ExitReport, ProcessControl, SandboxProcess};
use crate::sandbox::{LimitKind, SandboxLimits, SpawnPlan};

const SHELL: &str = "/bin/sh";

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Map `len` bytes of private anonymous read+write memory.
pub(crate) fn alloc_writable(len: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(len).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: a fresh anonymous mapping aliases no existing memory.
    let ptr = unsafe {
        mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }?;

    Ok(ptr.cast())
}

/// Drop write access and grant execute on a mapping from [`alloc_writable`].
///
/// # Safety
/// `ptr`/`len` must describe a live mapping returned by `alloc_writable`.
pub(crate) unsafe fn protect_exec(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { mprotect(ptr.cast::<c_void>(), len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC) }?;
    Ok(())
}

/// # Safety
/// `ptr`/`len` must describe a live mapping.
pub(crate) unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
    #[cfg(all(any(target_arch = "aarch64", target_arch = "arm"), not(target_vendor = "apple")))]
    {
        unsafe extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        let start = ptr.as_ptr().cast::<libc::c_char>();
        unsafe { __clear_cache(start, start.add(len)) };
    }

    #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
    {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut c_void, len: libc::size_t);
        }
        unsafe { sys_icache_invalidate(ptr.as_ptr().cast(), len) };
    }

    // x86 keeps instruction fetch coherent with data writes.
    #[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
    let _ = (ptr, len);
}

/// # Safety
/// `ptr`/`len` must describe a live mapping that nothing references anymore.
pub(crate) unsafe fn release(ptr: NonNull<u8>, len: usize) {
    if let Err(e) = unsafe { munmap(ptr.cast::<c_void>(), len) } {
        debug!("munmap of {} bytes failed: {}", len, e);
    }
}

/// POSIX applies limits per process; no container object exists.
#[derive(Debug)]
pub struct LimitContainer {
    _private: (),
}

/// Fork/exec backend with `setrlimit` in the child.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl ProcessControl for NativeBackend {
    fn create_container(&self, _limits: &SandboxLimits) -> io::Result<Option<LimitContainer>> {
        Ok(None)
    }

    fn spawn(
        &self,
        command: &str,
        plan: &SpawnPlan,
        _container: Option<&LimitContainer>,
    ) -> io::Result<Box<dyn SandboxProcess>> {
        // Resolved in the parent so the child only issues setrlimit syscalls.
        let rlimits: Vec<(Resource, u64)> = plan
            .settings()
            .iter()
            .filter_map(|s| resource_for(s.kind).map(|r| (r, s.value)))
            .collect();

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(command);

        // SAFETY: the hook runs between fork and exec and only calls
        // setrlimit, which is async-signal-safe. Failures are ignored: limits
        // are best effort.
        unsafe {
            cmd.pre_exec(move || {
                for &(resource, value) in &rlimits {
                    let _ = setrlimit(resource, value, value);
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        debug!("Spawned {} -c {:?} as pid {}", SHELL, command, child.id());
        Ok(Box::new(child))
    }

    fn memory_usage(&self, pid: u32) -> u64 {
        if pid == 0 {
            return 0;
        }

        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string(format!("/proc/{}/status", pid))
                .ok()
                .and_then(|s| procfs::vm_rss_bytes(&s))
                .unwrap_or(0)
        }

        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    fn cpu_time_ms(&self, pid: u32) -> u64 {
        if pid == 0 {
            return 0;
        }

        #[cfg(target_os = "linux")]
        {
            // SAFETY: sysconf has no memory-safety preconditions.
            let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
            if ticks_per_sec <= 0 {
                return 0;
            }
            std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|s| procfs::cpu_ticks(&s))
                .map(|ticks| ticks.saturating_mul(1000) / ticks_per_sec as u64)
                .unwrap_or(0)
        }

        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}

fn resource_for(kind: LimitKind) -> Option<Resource> {
    match kind {
        LimitKind::Memory => Some(Resource::RLIMIT_AS),
        LimitKind::CpuTime => Some(Resource::RLIMIT_CPU),
        LimitKind::OpenFiles => Some(Resource::RLIMIT_NOFILE),
        #[cfg(target_os = "linux")]
        LimitKind::Processes => Some(Resource::RLIMIT_NPROC),
        #[cfg(not(target_os = "linux"))]
        LimitKind::Processes => None,
    }
}

impl SandboxProcess for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitReport>> {
        Ok(Child::try_wait(self)?.map(ExitReport::from))
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<ExitReport> {
        Child::wait(self).map(ExitReport::from)
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    /// `VmRSS` from `/proc/<pid>/status`, in bytes.
    pub(super) fn vm_rss_bytes(status: &str) -> Option<u64> {
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    }

    /// `utime + stime` from `/proc/<pid>/stat`, in clock ticks.
    ///
    /// The command name may contain spaces and parentheses, so fields are
    /// counted from the last `)`.
    pub(super) fn cpu_ticks(stat: &str) -> Option<u64> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        // state is field 3; utime and stime are fields 14 and 15.
        let utime: u64 = fields.nth(11)?.parse().ok()?;
        let stime: u64 = fields.next()?.parse().ok()?;
        Some(utime + stime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_goes_writable_then_executable() {
        let len = page_size();
        let ptr = alloc_writable(len).unwrap();
        unsafe {
            ptr.as_ptr().write(0xC3);
            protect_exec(ptr, len).unwrap();
            flush_icache(ptr, len);
            assert_eq!(ptr.as_ptr().read(), 0xC3);
            release(ptr, len);
        }
    }

    #[test]
    fn zero_length_mapping_is_rejected() {
        assert!(alloc_writable(0).is_err());
    }

    #[test]
    fn introspection_of_pid_zero_is_zero() {
        let backend = NativeBackend;
        assert_eq!(backend.memory_usage(0), 0);
        assert_eq!(backend.cpu_time_ms(0), 0);
    }

    #[test]
    fn container_is_not_needed() {
        let limits = SandboxLimits {
            max_memory: 1 << 20,
            ..Default::default()
        };
        assert!(NativeBackend.create_container(&limits).unwrap().is_none());
    }

    #[test]
    fn spawn_runs_through_the_shell() {
        let plan = SpawnPlan::default();
        let mut child = NativeBackend.spawn("exit 7", &plan, None).unwrap();
        assert!(child.pid() > 0);
        let report = child.wait().unwrap();
        assert_eq!(report.code, Some(7));
        assert!(!report.is_abnormal());
    }

    #[test]
    fn spawn_applies_open_file_limit() {
        let limits = SandboxLimits {
            max_files: 17,
            ..Default::default()
        };
        let plan = SpawnPlan::posix(&limits, false);
        let mut child = NativeBackend
            .spawn("test \"$(ulimit -n)\" = 17", &plan, None)
            .unwrap();
        assert!(child.wait().unwrap().success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_child_reports_usage() {
        let plan = SpawnPlan::default();
        let mut child = NativeBackend.spawn("sleep 2", &plan, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(NativeBackend.memory_usage(child.pid()) > 0);
        child.kill().unwrap();
        let report = child.wait().unwrap();
        assert_eq!(report.signal, Some(libc::SIGKILL));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tsleep\nVmPeak:\t   8000 kB\nVmRSS:\t    812 kB\nThreads:\t1\n";
        assert_eq!(procfs::vm_rss_bytes(status), Some(812 * 1024));
        assert_eq!(procfs::vm_rss_bytes("Name:\tzombie\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_cpu_ticks_with_awkward_comm() {
        let stat = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194304 100 0 0 0 25 17 0 0 20 0 1 0 1000 1000 100";
        assert_eq!(procfs::cpu_ticks(stat), Some(42));
        assert_eq!(procfs::cpu_ticks("garbage"), None);
    }
}
