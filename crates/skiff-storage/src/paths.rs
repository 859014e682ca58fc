//! Application directory layout.
//!
//! ```text
//! <root>/
//!   settings.json
//!   logs/       rotating log files
//!   cache/http/ fetched rule lists and presets
//!   runtime/    generated sslocal configs
//!   state/      proxy_snapshot.json recovery record
//!   secrets/    one file per secret id
//! ```

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{Result, StorageError};

/// Resolved application directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub settings_file: PathBuf,
    pub logs: PathBuf,
    pub cache: PathBuf,
    pub runtime: PathBuf,
    pub state: PathBuf,
    pub secrets: PathBuf,
}

impl AppPaths {
    /// Paths under the platform's local data directory.
    pub fn discover() -> Result<Self> {
        let dirs = ProjectDirs::from("", "skiff", "Skiff").ok_or_else(|| {
            StorageError::Config("Could not determine app data directory".into())
        })?;
        Ok(Self::under(dirs.data_local_dir()))
    }

    /// Paths under an explicit root.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            settings_file: root.join("settings.json"),
            logs: root.join("logs"),
            cache: root.join("cache"),
            runtime: root.join("runtime"),
            state: root.join("state"),
            secrets: root.join("secrets"),
            root,
        }
    }

    /// HTTP cache directory.
    pub fn http_cache(&self) -> PathBuf {
        self.cache.join("http")
    }

    /// Durable proxy recovery record.
    pub fn proxy_snapshot_file(&self) -> PathBuf {
        self.state.join("proxy_snapshot.json")
    }

    /// Creates every directory.
    pub fn ensure_created(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.logs,
            &self.cache,
            &self.runtime,
            &self.state,
            &self.secrets,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.http_cache())?;
        Ok(())
    }
}
