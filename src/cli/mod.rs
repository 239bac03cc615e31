pub mod code;
pub mod config;
pub mod hex;
pub mod paths;
pub mod sandbox;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "execbox")]
#[command(author, version, about = "Run raw machine code and resource-limited shell commands")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "EXECBOX_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decode and encode hex byte listings
    Hex(hex::HexArgs),

    /// Load and execute raw machine code in this process
    Code(code::CodeArgs),

    /// Run commands under resource limits
    Sandbox(sandbox::SandboxArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
