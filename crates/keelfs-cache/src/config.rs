//! Page cache configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::page::PAGE_SIZE;

/// Where pages go when they fall out of the memory tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SwapMode {
    /// One file per page under `dir`.
    Disk {
        /// Swap root; created if missing.
        dir: PathBuf,
        /// Snappy-compress page files.
        #[serde(default)]
        compress: bool,
    },
    /// Unbounded in-memory map.
    #[default]
    Memory,
    /// No second tier: evicted pages are dropped.
    Disabled,
}

/// Two-tier page cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the memory tier.
    pub l1_max_memory: u64,
    /// Second tier.
    pub swap: SwapMode,
    /// Promote a page found in the second tier back into memory.
    pub refill_on_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_memory: 64 * 1024 * 1024,
            swap: SwapMode::Memory,
            refill_on_miss: true,
        }
    }
}

impl CacheConfig {
    /// Load a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CacheConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject budgets too small to hold a single page.
    pub fn validate(&self) -> Result<()> {
        if self.l1_max_memory < PAGE_SIZE as u64 {
            return Err(CacheError::Config(format!(
                "l1_max_memory {} is smaller than one page ({})",
                self.l1_max_memory, PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Number of whole pages the memory tier can hold.
    pub fn l1_pages(&self) -> u64 {
        self.l1_max_memory / PAGE_SIZE as u64
    }
}
