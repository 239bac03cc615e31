use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use execbox::cli::{self, Cli, Commands};
use execbox::config::{Config, LogFormat};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = Config::load_from(cli.config.as_deref())?;
    init_logging(cli.verbose, &config)?;

    match cli.command {
        Commands::Hex(args) => cli::hex::run(args).await,
        Commands::Code(args) => cli::code::run(args).await,
        Commands::Sandbox(args) => cli::sandbox::run(args, &config).await,
        Commands::Config(args) => cli::config::run(args, config).await,
        Commands::Paths => cli::paths::run(),
    }
}

fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let writer = if config.logging.file {
        config.paths.ensure_dirs()?;
        let path = config.paths.log_file();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        BoxMakeWriter::new(Mutex::new(file))
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(())
}
