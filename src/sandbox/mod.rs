//! Resource-limited execution of shell commands and raw machine code.
//!
//! A [`Sandbox`] runs one command at a time through the platform shell:
//!
//! - Unix: `/bin/sh -c`, with `setrlimit` applied in the child before exec
//! - Windows: `cmd.exe /C`, started suspended and attached to a job object
//!
//! [`SandboxMode::Vm`] instead calls machine code directly in the host
//! process. It offers no isolation at all.

pub mod controller;
pub mod limits;

pub use controller::{Sandbox, SandboxReport, SandboxStatus};
pub use limits::{LimitKind, LimitSetting, SandboxLimits, SandboxMode, SpawnPlan, prepare};
