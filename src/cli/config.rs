use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., sandbox.max_memory)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., sandbox.mode)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config: Config) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&config, &format),
        ConfigCommands::Get { key } => {
            println!("{}", config.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Set { key, value } => set_config(config, &key, &value),
        ConfigCommands::Path => {
            println!("{}", config.source.display());
            Ok(())
        }
        ConfigCommands::Init { force } => init_config(&config, force),
    }
}

fn show_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        _ => println!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

fn set_config(mut config: Config, key: &str, value: &str) -> Result<()> {
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn init_config(config: &Config, force: bool) -> Result<()> {
    let path = &config.source;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    config.save_with_template()?;
    println!("Created config file at {}", path.display());
    Ok(())
}
