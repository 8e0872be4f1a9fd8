//! Layered TOML configuration for ferry.
//!
//! Provides the configuration schema for the forwarders and the containers
//! they serve, loading from:
//! - Global config: `~/.config/ferry/ferry.toml`
//! - Project config: `<workspace>/.ferry/ferry.toml`
//!
//! Project values take precedence for scalar fields; container tables are
//! merged with project entries replacing global ones of the same id.
//!
//! # Example
//!
//! ```no_run
//! use ferry_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.containers.keys());
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[forwarder]` section: tunables shared by every forwarder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderSettings {
    /// Upstream connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// How long an idle pooled SOCKS connection stays usable, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_idle_timeout_secs: Option<u64>,
}

/// One `[containers.<id>]` table: the upstream proxy for that container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerProxy {
    /// Proxy protocol: `http`, `https`, or `socks5`.
    #[serde(default = "default_kind")]
    pub kind: String,

    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_kind() -> String {
    "http".to_string()
}

/// Top-level ferry configuration, corresponding to `ferry.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Forwarder tunables.
    #[serde(default)]
    pub forwarder: ForwarderSettings,

    /// Upstream proxy per container id.
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerProxy>,
}

impl FerryConfig {
    /// Parse a `FerryConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `FerryConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// - Forwarder scalars: `other` wins when explicitly set (`Some`).
    /// - Containers: both contribute; a project container replaces a global
    ///   one with the same id.
    #[must_use]
    pub fn merge(mut self, other: FerryConfig) -> FerryConfig {
        if other.forwarder.connect_timeout_secs.is_some() {
            self.forwarder.connect_timeout_secs = other.forwarder.connect_timeout_secs;
        }
        if other.forwarder.pool_idle_timeout_secs.is_some() {
            self.forwarder.pool_idle_timeout_secs = other.forwarder.pool_idle_timeout_secs;
        }
        self.containers.extend(other.containers);
        self
    }
}
