use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, SandboxConfig};
use crate::hex;
use crate::platform::ExitReport;
use crate::sandbox::{Sandbox, SandboxLimits, SandboxMode, SandboxStatus, prepare};

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Run a shell command under resource limits and wait for it
    Run(RunArgs),

    /// Execute hex machine code in a VM-mode sandbox (no isolation)
    ExecCode {
        /// Machine code as hex text
        hex: String,
    },

    /// Show configured defaults and which limits this platform enforces
    Status,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Command line handed to the platform shell
    pub command: String,

    /// Sandbox mode (default from config)
    #[arg(short, long, value_enum)]
    pub mode: Option<SandboxMode>,

    /// Memory limit in bytes
    #[arg(long)]
    pub max_memory: Option<u64>,

    /// CPU time limit in milliseconds
    #[arg(long)]
    pub max_cpu_ms: Option<u64>,

    /// Open file limit
    #[arg(long)]
    pub max_files: Option<u32>,

    /// Process limit
    #[arg(long)]
    pub max_processes: Option<u32>,

    /// Status polling interval in milliseconds
    #[arg(long)]
    pub poll_ms: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Outcome of one supervised command.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub command: String,
    pub mode: SandboxMode,
    pub limits: SandboxLimits,
    pub pid: u32,
    pub exit: Option<ExitReport>,
    pub interrupted: bool,
    /// Largest sampled resident size. Usage is read on each poll while the
    /// child is alive, so a command that exits between polls may report 0.
    pub peak_memory_bytes: u64,
    /// Last sampled CPU time, same caveat as `peak_memory_bytes`.
    pub cpu_time_ms: u64,
    /// Polls that returned usage data.
    pub usage_samples: u32,
    pub elapsed_ms: u64,
}

pub async fn run(args: SandboxArgs, config: &Config) -> Result<()> {
    match args.command {
        SandboxCommands::Run(run_args) => run_command(run_args, &config.sandbox).await,
        SandboxCommands::ExecCode { hex } => exec_code(&hex),
        SandboxCommands::Status => {
            show_status(config);
            Ok(())
        }
    }
}

fn resolve_limits(args: &RunArgs, defaults: &SandboxConfig) -> (SandboxMode, SandboxLimits) {
    let base = defaults.limits;
    let limits = SandboxLimits {
        max_memory: args.max_memory.unwrap_or(base.max_memory),
        max_cpu_time: args.max_cpu_ms.unwrap_or(base.max_cpu_time),
        max_files: args.max_files.unwrap_or(base.max_files),
        max_processes: args.max_processes.unwrap_or(base.max_processes),
    };
    (args.mode.unwrap_or(defaults.mode), limits)
}

async fn run_command(args: RunArgs, defaults: &SandboxConfig) -> Result<()> {
    let (mode, limits) = resolve_limits(&args, defaults);
    if mode == SandboxMode::Vm {
        anyhow::bail!("vm mode runs machine code; use `sandbox exec-code` instead");
    }
    let poll = Duration::from_millis(args.poll_ms.unwrap_or(defaults.poll_interval_ms).max(1));

    let sandbox = Sandbox::create(mode, limits)?;
    let summary = supervise(&sandbox, &args.command, poll, interrupt()).await;
    sandbox.destroy()?;
    let summary = summary?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    match summary.exit {
        Some(exit) if exit.success() => Ok(()),
        Some(exit) => anyhow::bail!("command {}", describe_exit(&exit)),
        None => anyhow::bail!("command did not report an exit status"),
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed,
/// so the command is not stopped by mistake.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Start `command` and poll until it exits or `cancel` resolves, in which
/// case the command is stopped.
pub async fn supervise<F>(
    sandbox: &Sandbox,
    command: &str,
    poll: Duration,
    cancel: F,
) -> Result<RunSummary>
where
    F: Future<Output = ()>,
{
    let started = Instant::now();
    let pid = sandbox.exec(command)?;
    info!("Started pid {} ({} mode)", pid, sandbox.mode());

    let mut interval = tokio::time::interval(poll);
    let mut peak_memory_bytes = 0;
    let mut cpu_time_ms = 0;
    let mut interrupted = false;
    let mut samples = 0;
    tokio::pin!(cancel);

    loop {
        tokio::select! {
            _ = &mut cancel => {
                info!("Interrupted; stopping pid {}", pid);
                if sandbox.status() == SandboxStatus::Running {
                    sandbox.stop()?;
                }
                interrupted = true;
                break;
            }
            _ = interval.tick() => {
                // Sample first: the status check reaps an exited child, after
                // which its usage can no longer be read.
                let (memory, cpu) = (sandbox.memory(), sandbox.cpu_time());
                if memory != 0 || cpu != 0 {
                    samples += 1;
                    peak_memory_bytes = peak_memory_bytes.max(memory);
                    cpu_time_ms = cpu_time_ms.max(cpu);
                }
                if sandbox.status() == SandboxStatus::Idle {
                    break;
                }
                debug!(
                    "pid {}: rss {} bytes, cpu {} ms",
                    pid, peak_memory_bytes, cpu_time_ms
                );
            }
        }
    }

    Ok(RunSummary {
        command: command.to_string(),
        mode: sandbox.mode(),
        limits: sandbox.limits(),
        pid,
        exit: sandbox.last_exit(),
        interrupted,
        peak_memory_bytes,
        cpu_time_ms,
        usage_samples: samples,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

fn exec_code(hex_source: &str) -> Result<()> {
    let code = hex::decode(hex_source)?;
    let sandbox = Sandbox::create(SandboxMode::Vm, SandboxLimits::default())?;
    let result = sandbox.exec_code(&code);
    sandbox.destroy()?;
    println!("{}", result?);
    Ok(())
}

fn show_status(config: &Config) {
    let sandbox = &config.sandbox;
    let plan = prepare(&sandbox.limits);

    println!("Sandbox defaults ({}):", config.source.display());
    println!("  Mode:          {}", sandbox.mode);
    println!("  Max memory:    {}", format_limit(sandbox.limits.max_memory, "bytes"));
    println!("  Max CPU time:  {}", format_limit(sandbox.limits.max_cpu_time, "ms"));
    println!(
        "  Max files:     {}",
        format_limit(u64::from(sandbox.limits.max_files), "")
    );
    println!(
        "  Max processes: {}",
        format_limit(u64::from(sandbox.limits.max_processes), "")
    );
    println!("  Poll interval: {} ms", sandbox.poll_interval_ms);
    println!();

    println!("Enforced on {}:", std::env::consts::OS);
    if plan.settings().is_empty() {
        println!("  (nothing, all limits unbounded)");
    }
    for setting in plan.settings() {
        println!("  {:?} = {}", setting.kind, setting.value);
    }
    for kind in plan.ignored() {
        println!("  {:?} ignored (not supported here)", kind);
    }
}

fn format_limit(value: u64, unit: &str) -> String {
    match (value, unit) {
        (0, _) => "unbounded".to_string(),
        (v, "") => v.to_string(),
        (v, unit) => format!("{} {}", v, unit),
    }
}

fn print_summary(summary: &RunSummary) {
    let exit = summary
        .exit
        .as_ref()
        .map_or_else(|| "unknown".to_string(), describe_exit);

    println!("pid:         {}", summary.pid);
    println!("exit:        {}", exit);
    if summary.interrupted {
        println!("interrupted: yes");
    }
    if summary.usage_samples == 0 {
        println!("usage:       not sampled (exited before first poll)");
    } else {
        println!(
            "peak rss:    {} bytes ({} samples)",
            summary.peak_memory_bytes, summary.usage_samples
        );
        println!("cpu time:    {} ms (last sample)", summary.cpu_time_ms);
    }
    println!("elapsed:     {} ms", summary.elapsed_ms);
}

fn describe_exit(exit: &ExitReport) -> String {
    match (exit.code, exit.signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("killed by {}", signal_name(signal)),
        (None, None) => "terminated".to_string(),
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signal))
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    format!("signal {}", signal)
}
