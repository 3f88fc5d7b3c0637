//! File system paths for the extension's persisted state.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

const BASE_DIR_NAME: &str = ".auth-sync";

/// Manages file system paths for the extension.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for persisted state (~/.auth-sync)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.auth-sync`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.auth-sync).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.auth-sync/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the cookie jar path (~/.auth-sync/cookies.json).
    pub fn cookies_file(&self) -> PathBuf {
        self.base_dir.join("cookies.json")
    }

    /// Get the extension storage path (~/.auth-sync/storage.json).
    pub fn storage_file(&self) -> PathBuf {
        self.base_dir.join("storage.json")
    }

    /// Get the logs directory (~/.auth-sync/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
