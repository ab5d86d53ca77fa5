//! Sandbox configuration loaded from TOML

use crate::error::{Result, SandboxError};
use crate::limits::SandboxLimits;
use crate::program::ProgramLoader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which interpreter backend to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Lua,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramSettings {
    /// Directory named programs are resolved in
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for ProgramSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("programs"),
            extension: "lua".to_string(),
        }
    }
}

impl ProgramSettings {
    pub fn loader(&self) -> ProgramLoader {
        ProgramLoader::new(&self.dir).with_extension(&self.extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Run time after which an execution is terminated (None = no limit)
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,

    /// Output chunks buffered per execution before the script blocks
    pub stdout_capacity: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(30)),
            stdout_capacity: 128,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub engine: EngineKind,
    pub limits: SandboxLimits,
    pub programs: ProgramSettings,
    pub service: ServiceSettings,
}

impl SandboxConfig {
    /// Default location: `~/.config/consoles/sandbox.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("consoles").join("sandbox.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| SandboxError::Configuration(format!("invalid sandbox config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "Loaded sandbox config");
        Ok(config)
    }

    /// Load the default file if it exists, otherwise use defaults.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}
