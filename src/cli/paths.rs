//! CLI subcommand: `execbox paths`

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("execbox Paths (XDG Base Directory)");
    println!("==================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!("  log file:       {}", paths.log_file().display());

    Ok(())
}
