//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. execbox-specific env var (EXECBOX_CONFIG_DIR, EXECBOX_STATE_DIR)
//! 2. XDG env var (XDG_CONFIG_HOME, XDG_STATE_HOME) via `etcetera`
//! 3. Platform default (~/.config, ~/.local/state)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directories for the application. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Log files
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "EXECBOX_CONFIG_DIR", || {
            strategy.config_dir().join("execbox")
        });

        let state_dir = env_or(&env_fn, "EXECBOX_STATE_DIR", || {
            // state_dir() is None on platforms without XDG_STATE_HOME.
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("execbox")
        });

        Ok(Self {
            config_dir,
            state_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Log file used when `[logging] file = true`: state_dir/logs/execbox.log
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("execbox.log")
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir, &self.logs_dir()] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("execbox"),
                state_dir: home.join(".local").join("state").join("execbox"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(
            paths.config_dir.ends_with("execbox"),
            "config_dir: {:?}",
            paths.config_dir
        );
        assert!(
            paths.state_dir.ends_with("execbox"),
            "state_dir: {:?}",
            paths.state_dir
        );
        assert!(paths.config_dir.is_absolute());
    }

    #[test]
    fn env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("EXECBOX_CONFIG_DIR", "/custom/config");
        env.insert("EXECBOX_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.config_file(), PathBuf::from("/custom/config/config.toml"));
        assert_eq!(
            paths.log_file(),
            PathBuf::from("/custom/state/logs/execbox.log")
        );
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("EXECBOX_CONFIG_DIR", "relative/path");
        env.insert("EXECBOX_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert_ne!(paths.config_dir, PathBuf::from("relative/path"));
        assert!(paths.state_dir.is_absolute());
        assert!(paths.state_dir.ends_with("execbox"));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: tmp.path().join("config"),
            state_dir: tmp.path().join("state"),
        };
        paths.ensure_dirs().unwrap();

        assert!(paths.config_dir.is_dir());
        assert!(paths.logs_dir().is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.config_dir)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
