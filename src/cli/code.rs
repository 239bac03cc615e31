use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::code::{self, ExecContext, InstructionStream};

#[derive(Args)]
pub struct CodeArgs {
    #[command(subcommand)]
    pub command: CodeCommands,
}

#[derive(Subcommand)]
pub enum CodeCommands {
    /// Load hex machine code and call it as `int entry(int argc, char **argv)`
    Run {
        /// Machine code as hex text, e.g. "B8 2A 00 00 00 C3"
        hex: String,

        /// Argument passed to the code (repeatable)
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Architecture the code was written for (defaults to the host)
        #[arg(long)]
        arch: Option<String>,

        /// Print the loaded bytes before executing
        #[arg(long)]
        dump: bool,
    },

    /// Parse an assembly-like instruction file and try to assemble it
    Stream {
        file: PathBuf,

        /// Architecture the instructions target (defaults to the host)
        #[arg(long)]
        arch: Option<String>,
    },
}

pub async fn run(args: CodeArgs) -> Result<()> {
    match args.command {
        CodeCommands::Run {
            hex,
            args,
            arch,
            dump,
        } => {
            let result = run_hex(&hex, args, arch.as_deref(), dump)?;
            println!("{}", result);
            Ok(())
        }
        CodeCommands::Stream { file, arch } => run_stream(&file, arch.as_deref()),
    }
}

fn run_hex(hex: &str, args: Vec<String>, arch: Option<&str>, dump: bool) -> Result<i32> {
    let host = code::host_arch();
    let arch = arch.unwrap_or(host);

    let block = code::assemble_text(arch, "native", hex)?;
    if dump {
        println!("{}", code::dump_hex(&block)?.trim_end());
    }

    if arch != host {
        anyhow::bail!("Refusing to execute {} code on a {} host", arch, host);
    }

    let ctx = ExecContext::new(args);
    Ok(code::execute(&block, Some(&ctx))?)
}

fn run_stream(file: &Path, arch: Option<&str>) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let stream = InstructionStream::parse(arch.unwrap_or(code::host_arch()), &text);

    println!(
        "Parsed {} {} instructions",
        stream.len(),
        stream.architecture()
    );
    for instruction in &stream {
        tracing::debug!("  {}", instruction);
    }

    code::assemble_stream(&stream, "native")
        .map(|_| ())
        .with_context(|| format!("Cannot assemble {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_architecture_is_not_executed() {
        let err = run_hex("C3", vec![], Some("riscv64"), false).unwrap_err();
        assert!(err.to_string().contains("riscv64"));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn run_hex_returns_code_result() {
        assert_eq!(run_hex("B8 2A 00 00 00 C3", vec![], None, false).unwrap(), 42);
    }

    #[tokio::test]
    async fn stream_reports_assembly_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("prog.s");
        std::fs::write(&file, "mov eax, 42\nret\n").unwrap();

        let err = run(CodeArgs {
            command: CodeCommands::Stream {
                file: file.clone(),
                arch: Some("x86_64".into()),
            },
        })
        .await
        .unwrap_err();

        assert!(format!("{:#}", err).contains("not implemented"));
    }
}
