use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use zferry_endpoints::Compression;
use zferry_endpoints::ssh::DEFAULT_PORT;

const FILE_NAME: &str = "config.toml";

/// Defaults read from `config.toml`; command-line options take precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ssh: SshSettings,
    pub send: SendSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    pub key: Option<PathBuf>,
    pub control_path: Option<PathBuf>,
    pub control_persist: Option<u64>,
    pub compression: Compression,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            key: None,
            control_path: None,
            control_persist: None,
            compression: Compression::Lzop,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSettings {
    pub raw: bool,
    pub force: bool,
    pub properties: bool,
    pub no_mount: bool,
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "zferry").map(|dirs| dirs.config_dir().join(FILE_NAME))
    }

    /// Reads `path`, or the per-user default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = Self::parse(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
