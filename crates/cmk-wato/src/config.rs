//! Configuration of the setup core.
//!
//! Loaded from a TOML or JSON file; every field has a default so partial
//! files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Product edition. Selects the folder attribute validator set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Raw edition.
    #[default]
    Raw,
    /// Enterprise edition.
    Enterprise,
    /// Managed services edition (customer attribute).
    Managed,
    /// Cloud edition.
    Cloud,
}

/// Settings of the optional folder index cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderIndexConfig {
    /// Whether the cached index is used at all.
    pub enabled: bool,
    /// Backing file of the key/value store. In-memory if unset.
    pub store_path: Option<PathBuf>,
    /// Maximum time to wait for the index lock.
    pub lock_timeout_ms: u64,
}

impl Default for FolderIndexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_path: None,
            lock_timeout_ms: 5000,
        }
    }
}

/// Main configuration of the setup core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatoConfig {
    /// Root directory of the folder tree.
    pub wato_root: PathBuf,
    /// Id of the local site; default value of the `site` attribute.
    pub site_id: String,
    /// Product edition.
    pub edition: Edition,
    /// Folder index cache settings.
    pub folder_index: FolderIndexConfig,
    /// Optional JSON-lines file receiving change log entries.
    pub change_log: Option<PathBuf>,
}

impl Default for WatoConfig {
    fn default() -> Self {
        Self {
            wato_root: PathBuf::from("/etc/check_mk/conf.d/wato"),
            site_id: String::from("local"),
            edition: Edition::Raw,
            folder_index: FolderIndexConfig::default(),
            change_log: None,
        }
    }
}

impl WatoConfig {
    /// Loads the configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: WatoConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: WatoConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Returns a configuration rooted at the given directory, defaults otherwise.
    pub fn with_root(wato_root: impl Into<PathBuf>) -> Self {
        Self {
            wato_root: wato_root.into(),
            ..Self::default()
        }
    }
}
