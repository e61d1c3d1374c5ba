use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dvn_studio::StudioConfig;
use dvn_types::ProtocolParams;

/// Audit ledger backend used when wiring a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Merkle,
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerBackend::Memory => write!(f, "memory"),
            LedgerBackend::Merkle => write!(f, "merkle"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
}

/// Top-level configuration for the `dvn` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DvnConfig {
    #[serde(default)]
    pub protocol: ProtocolParams,

    #[serde(default)]
    pub studio: StudioConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl DvnConfig {
    /// Config file path within the state directory.
    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join("dvn.toml")
    }

    /// Load config from disk. Returns default if not found.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config
            .protocol
            .validate()
            .context("Invalid [protocol] section")?;
        config.studio.validate().context("Invalid [studio] section")?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::config_path(state_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }
}
