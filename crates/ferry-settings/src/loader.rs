//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/ferry/ferry.toml`
//! 2. Project: `<workspace>/.ferry/ferry.toml`
//!
//! Project values take precedence for scalar fields; container tables are
//! merged so that both global and project entries contribute.

use crate::FerryConfig;
use std::path::{Path, PathBuf};

/// Loads and merges `FerryConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Reads the global config (`~/.config/ferry/ferry.toml`), then the
    /// project config (`<workspace>/.ferry/ferry.toml`), and merges them.
    /// Missing files are silently skipped. Parse errors log a warning and
    /// the file is treated as if absent.
    pub fn load(workspace: &Path) -> FerryConfig {
        let global = Self::load_optional(&Self::global_config_path());
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".ferry"))
            .join("ferry.toml")
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        Self::project_config_dir(workspace).join("ferry.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ferry"))
    }

    fn project_config_dir(workspace: &Path) -> PathBuf {
        workspace.join(".ferry")
    }

    fn load_optional(path: &Path) -> FerryConfig {
        if !path.exists() {
            return FerryConfig::default();
        }
        match FerryConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a malformed config shouldn't block startup.
                tracing::warn!(path = %path.display(), error = %err, "Ignoring unparseable config file");
                FerryConfig::default()
            }
        }
    }
}
