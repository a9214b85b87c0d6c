//! Path resolution for panos-reconcile
//!
//! # Environment Variables
//!
//! - `PANOS_RECONCILE_CONFIG_DIR` - Override config directory
//! - `PANOS_RECONCILE_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `PANOS_RECONCILE_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/panos-reconcile` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\panos-reconcile`
//!    - macOS/Linux: `~/.config/panos-reconcile`
//!
//! For state_dir():
//! 1. `PANOS_RECONCILE_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/panos-reconcile` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\panos-reconcile`
//!    - macOS/Linux: `~/.local/state/panos-reconcile`

use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_DIR: &str = "panos-reconcile";

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "PANOS_RECONCILE_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "PANOS_RECONCILE_STATE_DIR";

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            let path = app_data.join(APP_DIR);
            log::debug!("Using Windows config dir: {}", path.display());
            return Ok(path);
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the state directory path (state file and device snapshot)
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            let path = local_app_data.join(APP_DIR);
            log::debug!("Using Windows state dir: {}", path.display());
            return Ok(path);
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join(APP_DIR);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Run `f` with `key` set to `value`, restoring it afterwards
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    fn without_env_var<F, R>(key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::remove_var(key) };
        let result = f();
        if let Some(v) = original {
            // SAFETY: Tests run in isolation
            unsafe { env::set_var(key, v) };
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/config/path", || {
            assert_eq!(config_dir().unwrap(), PathBuf::from("/custom/config/path"));
        });
    }

    #[test]
    fn test_config_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_CONFIG_DIR, "~/.panos-tilde-test", || {
            assert_eq!(config_dir().unwrap(), home.join(".panos-tilde-test"));
        });
    }

    #[test]
    fn test_state_dir_env_override() {
        with_env_var(ENV_STATE_DIR, "/custom/state/path", || {
            assert_eq!(state_dir().unwrap(), PathBuf::from("/custom/state/path"));
        });
    }

    #[test]
    fn test_xdg_state_home() {
        without_env_var(ENV_STATE_DIR, || {
            with_env_var("XDG_STATE_HOME", "/tmp/xdg-state-test", || {
                assert_eq!(state_dir().unwrap(), PathBuf::from("/tmp/xdg-state-test/panos-reconcile"));
            });
        });
    }

    #[test]
    fn test_expand_with_env_var() {
        with_env_var("PANOS_RECONCILE_TEST_VAR", "test_value", || {
            let result = expand("/path/$PANOS_RECONCILE_TEST_VAR/file");
            assert_eq!(result, PathBuf::from("/path/test_value/file"));
        });
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand("/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
