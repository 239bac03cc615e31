use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};
use winapi::shared::minwindef::{DWORD, FALSE, FILETIME, LPVOID};
use winapi::um::handleapi::CloseHandle;
use winapi::um::jobapi2::{AssignProcessToJobObject, SetInformationJobObject};
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::processthreadsapi::{
    CreateProcessW, FlushInstructionCache, GetCurrentProcess, GetExitCodeProcess,
    GetProcessTimes, OpenProcess, PROCESS_INFORMATION, ResumeThread, STARTUPINFOW,
    TerminateProcess,
};
use winapi::um::psapi::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winbase::{CREATE_SUSPENDED, CreateJobObjectW, INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::{
    HANDLE, JOB_OBJECT_LIMIT_ACTIVE_PROCESS, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
    JOB_OBJECT_LIMIT_PROCESS_TIME, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectExtendedLimitInformation, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
    PAGE_READWRITE, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use super::{ExitReport, ProcessControl, SandboxProcess};
use crate::sandbox::{LimitKind, SandboxLimits, SpawnPlan};

pub(crate) fn page_size() -> usize {
    let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

pub(crate) fn alloc_writable(len: usize) -> io::Result<NonNull<u8>> {
    if len == 0 {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    let ptr = unsafe { VirtualAlloc(ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
}

/// # Safety
/// `ptr`/`len` must describe a live allocation from [`alloc_writable`].
pub(crate) unsafe fn protect_exec(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    let mut old: DWORD = 0;
    if unsafe { VirtualProtect(ptr.as_ptr().cast(), len, PAGE_EXECUTE_READ, &mut old) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
/// `ptr`/`len` must describe a live allocation.
pub(crate) unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
    unsafe { FlushInstructionCache(GetCurrentProcess(), ptr.as_ptr() as LPVOID, len) };
}

/// # Safety
/// `ptr` must be a live allocation that nothing references anymore.
pub(crate) unsafe fn release(ptr: NonNull<u8>, len: usize) {
    if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
        debug!("VirtualFree of {} bytes failed: {}", len, io::Error::last_os_error());
    }
}

/// Job Object holding the sandbox's limits. Closed on drop.
#[derive(Debug)]
pub struct LimitContainer {
    job: HANDLE,
}

// The job handle is a kernel object reference usable from any thread.
unsafe impl Send for LimitContainer {}
unsafe impl Sync for LimitContainer {}

impl LimitContainer {
    fn create(limits: &SandboxLimits) -> io::Result<Self> {
        let job = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
        if job.is_null() {
            return Err(io::Error::last_os_error());
        }
        let container = Self { job };

        let plan = SpawnPlan::job_object(limits);
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        for setting in plan.settings() {
            match setting.kind {
                LimitKind::Memory => {
                    info.ProcessMemoryLimit = setting.value as usize;
                    info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
                }
                LimitKind::CpuTime => {
                    unsafe {
                        *info.BasicLimitInformation.PerProcessUserTimeLimit.QuadPart_mut() =
                            setting.value as i64;
                    }
                    info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_TIME;
                }
                LimitKind::Processes => {
                    info.BasicLimitInformation.ActiveProcessLimit = setting.value as DWORD;
                    info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
                }
                LimitKind::OpenFiles => {}
            }
        }

        let ok = unsafe {
            SetInformationJobObject(
                container.job,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as LPVOID,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            )
        };
        if ok == 0 {
            warn!("SetInformationJobObject failed, limits not applied: {}", io::Error::last_os_error());
        }

        Ok(container)
    }
}

impl Drop for LimitContainer {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.job) };
    }
}

/// CreateProcess backend: suspended child, attached to the job, resumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl ProcessControl for NativeBackend {
    fn create_container(&self, limits: &SandboxLimits) -> io::Result<Option<LimitContainer>> {
        LimitContainer::create(limits).map(Some)
    }

    fn spawn(
        &self,
        command: &str,
        _plan: &SpawnPlan,
        container: Option<&LimitContainer>,
    ) -> io::Result<Box<dyn SandboxProcess>> {
        let mut cmdline: Vec<u16> = OsStr::new(&format!("cmd.exe /C {}", command))
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };

        let created = unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                FALSE,
                CREATE_SUSPENDED,
                ptr::null_mut(),
                ptr::null(),
                &mut startup,
                &mut info,
            )
        };
        if created == 0 {
            return Err(io::Error::last_os_error());
        }

        if let Some(container) = container
            && unsafe { AssignProcessToJobObject(container.job, info.hProcess) } == 0
        {
            warn!(
                "AssignProcessToJobObject failed, running without limits: {}",
                io::Error::last_os_error()
            );
        }

        unsafe {
            ResumeThread(info.hThread);
            CloseHandle(info.hThread);
        }

        debug!("Spawned cmd.exe /C {:?} as pid {}", command, info.dwProcessId);
        Ok(Box::new(WindowsProcess {
            handle: info.hProcess,
            pid: info.dwProcessId,
        }))
    }

    fn memory_usage(&self, pid: u32) -> u64 {
        if pid == 0 {
            return 0;
        }
        let Some(handle) = open(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ) else {
            return 0;
        };
        let mut counters: PROCESS_MEMORY_COUNTERS = unsafe { mem::zeroed() };
        let ok = unsafe {
            GetProcessMemoryInfo(
                handle,
                &mut counters,
                mem::size_of::<PROCESS_MEMORY_COUNTERS>() as DWORD,
            )
        };
        unsafe { CloseHandle(handle) };
        if ok == 0 { 0 } else { counters.WorkingSetSize as u64 }
    }

    fn cpu_time_ms(&self, pid: u32) -> u64 {
        if pid == 0 {
            return 0;
        }
        let Some(handle) = open(pid, PROCESS_QUERY_INFORMATION) else {
            return 0;
        };
        let mut created: FILETIME = unsafe { mem::zeroed() };
        let mut exited: FILETIME = unsafe { mem::zeroed() };
        let mut kernel: FILETIME = unsafe { mem::zeroed() };
        let mut user: FILETIME = unsafe { mem::zeroed() };
        let ok = unsafe { GetProcessTimes(handle, &mut created, &mut exited, &mut kernel, &mut user) };
        unsafe { CloseHandle(handle) };
        if ok == 0 {
            return 0;
        }
        (filetime_ticks(&kernel) + filetime_ticks(&user)) / 10_000
    }
}

fn open(pid: u32, access: DWORD) -> Option<HANDLE> {
    let handle = unsafe { OpenProcess(access, FALSE, pid) };
    (!handle.is_null()).then_some(handle)
}

fn filetime_ticks(ft: &FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

struct WindowsProcess {
    handle: HANDLE,
    pid: u32,
}

// Process handles may be waited on and terminated from any thread.
unsafe impl Send for WindowsProcess {}

impl WindowsProcess {
    fn exit_code(&self) -> io::Result<ExitReport> {
        let mut code: DWORD = 0;
        if unsafe { GetExitCodeProcess(self.handle, &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ExitReport {
            code: Some(code as i32),
            signal: None,
        })
    }
}

impl SandboxProcess for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitReport>> {
        match unsafe { WaitForSingleObject(self.handle, 0) } {
            WAIT_OBJECT_0 => self.exit_code().map(Some),
            _ => Ok(None),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if unsafe { TerminateProcess(self.handle, 1) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self) -> io::Result<ExitReport> {
        unsafe { WaitForSingleObject(self.handle, INFINITE) };
        self.exit_code()
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}
