use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;
use crate::sandbox::{SandboxLimits, SandboxMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// File this config was loaded from, or will be saved to (not serialized)
    #[serde(skip)]
    pub source: PathBuf,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default mode for `sandbox run`: none | process | vm | restricted
    #[serde(default)]
    pub mode: SandboxMode,

    /// Default limits (max_memory, max_cpu_time, max_files, max_processes)
    #[serde(flatten)]
    pub limits: SandboxLimits,

    /// Status/usage polling interval for `sandbox run`, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when neither RUST_LOG nor --verbose is given
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Write logs to state_dir/logs/execbox.log instead of stderr
    #[serde(default)]
    pub file: bool,
}

fn default_poll_interval() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::default(),
            limits: SandboxLimits::default(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: false,
        }
    }
}

impl Config {
    /// Load from `path`, or from `<config_dir>/config.toml` when `None`.
    ///
    /// A missing file yields defaults; nothing is written.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let source = path.map_or_else(|| paths.config_file(), Path::to_path_buf);

        if !source.exists() {
            return Ok(Config {
                paths,
                source,
                ..Config::default()
            });
        }

        let content = fs::read_to_string(&source)
            .with_context(|| format!("Failed to read config: {}", source.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", source.display()))?;
        config.paths = paths;
        config.source = source;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.source.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&self.source, content)?;

        Ok(())
    }

    /// Write the commented default template to `source`.
    pub fn save_with_template(&self) -> Result<()> {
        if let Some(parent) = self.source.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.source, DEFAULT_CONFIG_TEMPLATE)?;

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let limits = &self.sandbox.limits;

        match parts.as_slice() {
            ["sandbox", "mode"] => Ok(self.sandbox.mode.to_string()),
            ["sandbox", "max_memory"] => Ok(limits.max_memory.to_string()),
            ["sandbox", "max_cpu_time"] => Ok(limits.max_cpu_time.to_string()),
            ["sandbox", "max_files"] => Ok(limits.max_files.to_string()),
            ["sandbox", "max_processes"] => Ok(limits.max_processes.to_string()),
            ["sandbox", "poll_interval_ms"] => Ok(self.sandbox.poll_interval_ms.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(format!("{:?}", self.logging.format).to_lowercase()),
            ["logging", "file"] => Ok(self.logging.file.to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let limits = &mut self.sandbox.limits;

        match parts.as_slice() {
            ["sandbox", "mode"] => {
                self.sandbox.mode = SandboxMode::from_str(value, true)
                    .map_err(|e| anyhow::anyhow!("Invalid sandbox mode: {}", e))?
            }
            ["sandbox", "max_memory"] => limits.max_memory = value.parse()?,
            ["sandbox", "max_cpu_time"] => limits.max_cpu_time = value.parse()?,
            ["sandbox", "max_files"] => limits.max_files = value.parse()?,
            ["sandbox", "max_processes"] => limits.max_processes = value.parse()?,
            ["sandbox", "poll_interval_ms"] => self.sandbox.poll_interval_ms = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => {
                self.logging.format = LogFormat::from_str(value, true)
                    .map_err(|e| anyhow::anyhow!("Invalid log format: {}", e))?
            }
            ["logging", "file"] => self.logging.file = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

/// Default config template with helpful comments (used by `config init`)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# execbox configuration

[sandbox]
# Default mode for `execbox sandbox run`: none | process | vm | restricted
mode = "none"

# Default resource limits. 0 leaves a resource unbounded.
max_memory = 0          # bytes (address space on Unix, job memory on Windows)
max_cpu_time = 0        # milliseconds (rounded up to whole seconds on Unix)
max_files = 0           # open file descriptors (Unix only)
max_processes = 0       # processes (Linux and Windows)

# How often `sandbox run` polls status and usage
poll_interval_ms = 100

[logging]
# Overridden by RUST_LOG and --verbose
level = "info"
format = "text"         # text | json
# file = true           # log to <state_dir>/logs/execbox.log instead of stderr
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.toml");

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.sandbox.mode, SandboxMode::None);
        assert!(config.sandbox.limits.is_unbounded());
        assert_eq!(config.sandbox.poll_interval_ms, 100);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.source, path);
        assert!(!path.exists());
    }

    #[test]
    fn default_source_is_config_dir_file() {
        let config = Config::load_from(None).unwrap();
        assert_eq!(config.source, config.paths.config_file());
        assert!(config.source.ends_with("config.toml"));
    }

    #[test]
    fn template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.sandbox.mode, SandboxMode::None);
        assert_eq!(config.sandbox.limits, SandboxLimits::default());
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(!config.logging.file);
    }

    #[test]
    fn sandbox_section_is_flat() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[sandbox]
mode = "restricted"
max_memory = 67108864
max_cpu_time = 1500

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.sandbox.mode, SandboxMode::Restricted);
        assert_eq!(config.sandbox.limits.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.sandbox.limits.max_cpu_time, 1500);
        assert_eq!(config.sandbox.limits.max_files, 0);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn invalid_toml_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[sandbox]\nmode = \"jail\"\n").unwrap();

        let err = Config::load_from(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    fn set_value_then_save_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut config = Config::load_from(Some(&path)).unwrap();
        config.set_value("sandbox.mode", "Process").unwrap();
        config.set_value("sandbox.max_files", "32").unwrap();
        config.set_value("logging.format", "json").unwrap();
        config.save().unwrap();

        let reloaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.get_value("sandbox.mode").unwrap(), "process");
        assert_eq!(reloaded.get_value("sandbox.max_files").unwrap(), "32");
        assert_eq!(reloaded.get_value("logging.format").unwrap(), "json");
    }

    #[test]
    fn unknown_and_malformed_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.get_value("agent.model").is_err());
        assert!(config.set_value("sandbox.max_memory", "lots").is_err());
        assert!(config.set_value("sandbox.mode", "jail").is_err());
    }

    #[test]
    fn save_with_template_writes_comments() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            source: tmp.path().join("config.toml"),
            ..Config::default()
        };
        config.save_with_template().unwrap();

        let written = fs::read_to_string(&config.source).unwrap();
        assert!(written.starts_with("# execbox configuration"));
    }
}
