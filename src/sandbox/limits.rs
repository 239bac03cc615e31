use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Isolation mode of a sandbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// No isolation container; commands still run in a child process.
    #[default]
    None,
    /// Separate OS process, with a limit container where the platform has one.
    Process,
    /// Raw machine code executed directly in the host process. No isolation.
    Vm,
    /// Process isolation plus resource limits.
    Restricted,
}

impl SandboxMode {
    /// Modes that pre-allocate a limit container at creation time.
    pub fn uses_container(self) -> bool {
        matches!(self, SandboxMode::Process | SandboxMode::Restricted)
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxMode::None => "none",
            SandboxMode::Process => "process",
            SandboxMode::Vm => "vm",
            SandboxMode::Restricted => "restricted",
        };
        f.write_str(name)
    }
}

/// Coarse resource caps. `0` leaves a resource unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Address space / process memory in bytes.
    #[serde(default)]
    pub max_memory: u64,

    /// CPU time in milliseconds.
    #[serde(default)]
    pub max_cpu_time: u64,

    /// Open file descriptors.
    #[serde(default)]
    pub max_files: u32,

    /// Processes.
    #[serde(default)]
    pub max_processes: u32,
}

impl SandboxLimits {
    pub fn is_unbounded(&self) -> bool {
        self.configured().is_empty()
    }

    /// Resources that carry a non-zero cap.
    pub fn configured(&self) -> Vec<LimitKind> {
        let mut kinds = Vec::new();
        if self.max_memory != 0 {
            kinds.push(LimitKind::Memory);
        }
        if self.max_cpu_time != 0 {
            kinds.push(LimitKind::CpuTime);
        }
        if self.max_files != 0 {
            kinds.push(LimitKind::OpenFiles);
        }
        if self.max_processes != 0 {
            kinds.push(LimitKind::Processes);
        }
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitKind {
    Memory,
    CpuTime,
    OpenFiles,
    Processes,
}

/// One limit, already converted to the platform's unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSetting {
    pub kind: LimitKind,
    pub value: u64,
}

/// Limits translated for the platform, ready to hand to a spawn.
///
/// On Unix the settings become `setrlimit` calls run in the child after fork
/// and before exec. On Windows they are the Job Object fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnPlan {
    settings: Vec<LimitSetting>,
    ignored: Vec<LimitKind>,
}

impl SpawnPlan {
    /// rlimit translation: bytes for `RLIMIT_AS`, whole seconds plus one for
    /// `RLIMIT_CPU`, plain counts for `RLIMIT_NOFILE` / `RLIMIT_NPROC`.
    pub fn posix(limits: &SandboxLimits, nproc_supported: bool) -> Self {
        let mut plan = Self::default();

        if limits.max_memory != 0 {
            plan.push(LimitKind::Memory, limits.max_memory);
        }
        if limits.max_cpu_time != 0 {
            plan.push(LimitKind::CpuTime, limits.max_cpu_time / 1000 + 1);
        }
        if limits.max_files != 0 {
            plan.push(LimitKind::OpenFiles, u64::from(limits.max_files));
        }
        if limits.max_processes != 0 {
            if nproc_supported {
                plan.push(LimitKind::Processes, u64::from(limits.max_processes));
            } else {
                plan.ignored.push(LimitKind::Processes);
            }
        }

        plan
    }

    /// Job Object translation: bytes, 100ns ticks of user time, active
    /// process count. Jobs have no open-file cap.
    pub fn job_object(limits: &SandboxLimits) -> Self {
        let mut plan = Self::default();

        if limits.max_memory != 0 {
            plan.push(LimitKind::Memory, limits.max_memory);
        }
        if limits.max_cpu_time != 0 {
            plan.push(LimitKind::CpuTime, limits.max_cpu_time.saturating_mul(10_000));
        }
        if limits.max_files != 0 {
            plan.ignored.push(LimitKind::OpenFiles);
        }
        if limits.max_processes != 0 {
            plan.push(LimitKind::Processes, u64::from(limits.max_processes));
        }

        plan
    }

    pub fn settings(&self) -> &[LimitSetting] {
        &self.settings
    }

    pub fn get(&self, kind: LimitKind) -> Option<u64> {
        self.settings
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.value)
    }

    /// Configured limits this platform cannot enforce.
    pub fn ignored(&self) -> &[LimitKind] {
        &self.ignored
    }

    fn push(&mut self, kind: LimitKind, value: u64) {
        self.settings.push(LimitSetting { kind, value });
    }
}

/// First phase of a sandboxed spawn: translate `limits` for this platform.
pub fn prepare(limits: &SandboxLimits) -> SpawnPlan {
    #[cfg(unix)]
    let plan = SpawnPlan::posix(limits, cfg!(target_os = "linux"));

    #[cfg(windows)]
    let plan = SpawnPlan::job_object(limits);

    #[cfg(not(any(unix, windows)))]
    let plan = SpawnPlan {
        settings: Vec::new(),
        ignored: limits.configured(),
    };

    for kind in plan.ignored() {
        warn!("{:?} limit is not enforceable on this platform, ignoring", kind);
    }
    debug!("Spawn plan: {:?}", plan.settings());

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_memory: 64 * 1024 * 1024,
            max_cpu_time: 2500,
            max_files: 32,
            max_processes: 8,
        }
    }

    #[test]
    fn zero_limits_produce_empty_plan() {
        let none = SandboxLimits::default();
        assert!(none.is_unbounded());
        assert!(SpawnPlan::posix(&none, true).settings().is_empty());
        assert!(SpawnPlan::job_object(&none).settings().is_empty());
    }

    #[test]
    fn posix_cpu_time_is_seconds_plus_one() {
        let plan = SpawnPlan::posix(&limits(), true);
        assert_eq!(plan.get(LimitKind::CpuTime), Some(3));

        let sub_second = SandboxLimits {
            max_cpu_time: 1,
            ..Default::default()
        };
        assert_eq!(
            SpawnPlan::posix(&sub_second, true).get(LimitKind::CpuTime),
            Some(1)
        );
    }

    #[test]
    fn posix_plan_maps_every_limit() {
        let plan = SpawnPlan::posix(&limits(), true);
        assert_eq!(plan.get(LimitKind::Memory), Some(64 * 1024 * 1024));
        assert_eq!(plan.get(LimitKind::OpenFiles), Some(32));
        assert_eq!(plan.get(LimitKind::Processes), Some(8));
        assert!(plan.ignored().is_empty());
    }

    #[test]
    fn posix_without_nproc_reports_ignored() {
        let plan = SpawnPlan::posix(&limits(), false);
        assert_eq!(plan.get(LimitKind::Processes), None);
        assert_eq!(plan.ignored(), &[LimitKind::Processes]);
    }

    #[test]
    fn job_plan_uses_hundred_nanosecond_ticks() {
        let plan = SpawnPlan::job_object(&limits());
        assert_eq!(plan.get(LimitKind::CpuTime), Some(25_000_000));
        assert_eq!(plan.get(LimitKind::Processes), Some(8));
        assert_eq!(plan.get(LimitKind::OpenFiles), None);
        assert_eq!(plan.ignored(), &[LimitKind::OpenFiles]);
    }

    #[test]
    fn container_modes() {
        assert!(SandboxMode::Process.uses_container());
        assert!(SandboxMode::Restricted.uses_container());
        assert!(!SandboxMode::Vm.uses_container());
        assert!(!SandboxMode::None.uses_container());
    }

    #[test]
    fn limits_deserialize_with_missing_fields() {
        let parsed: SandboxLimits = toml::from_str("max_memory = 1048576").unwrap();
        assert_eq!(parsed.max_memory, 1_048_576);
        assert_eq!(parsed.max_cpu_time, 0);
        assert_eq!(parsed.configured(), vec![LimitKind::Memory]);
    }
}
