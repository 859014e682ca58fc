//! JSON settings store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use skiff_core::orchestrator::{SettingsMutation, SettingsProvider};
use skiff_core::{AppSettings, CURRENT_SCHEMA_VERSION};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::atomic::write_atomic;
use crate::error::Result;

/// Settings persisted as one JSON document.
///
/// Every load and update goes through one gate, so a read-modify-write
/// never interleaves with another.
pub struct JsonSettingsStore {
    path: PathBuf,
    gate: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings, creating first-run defaults when the file is missing.
    ///
    /// An unreadable file yields defaults without overwriting it.
    pub async fn load_settings(&self) -> Result<AppSettings> {
        let _guard = self.gate.lock().await;
        self.load_unlocked().await
    }

    /// Applies `mutate` and persists the result.
    pub async fn update_settings<F>(&self, mutate: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let _guard = self.gate.lock().await;
        let mut settings = self.load_unlocked().await?;
        mutate(&mut settings);
        settings.schema_version = CURRENT_SCHEMA_VERSION;
        settings.updated_at = Utc::now();
        self.save_unlocked(&settings).await?;
        Ok(settings)
    }

    async fn load_unlocked(&self) -> Result<AppSettings> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let settings = AppSettings::first_run();
            self.save_unlocked(&settings).await?;
            info!(path = %self.path.display(), "Created default settings");
            return Ok(settings);
        }

        let parsed = tokio::fs::read(&self.path)
            .await
            .map_err(crate::StorageError::from)
            .and_then(|bytes| {
                serde_json::from_slice::<AppSettings>(&bytes).map_err(crate::StorageError::from)
            });

        match parsed {
            Ok(mut settings) => {
                if settings.schema_version < CURRENT_SCHEMA_VERSION {
                    info!(
                        from = settings.schema_version,
                        to = CURRENT_SCHEMA_VERSION,
                        "Migrating settings schema"
                    );
                    settings.schema_version = CURRENT_SCHEMA_VERSION;
                    self.save_unlocked(&settings).await?;
                }
                Ok(settings)
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read settings, using defaults");
                Ok(AppSettings::first_run())
            }
        }
    }

    async fn save_unlocked(&self, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        write_atomic(&self.path, &json).await
    }
}

#[async_trait]
impl SettingsProvider for JsonSettingsStore {
    async fn load(&self) -> skiff_core::Result<AppSettings> {
        Ok(self.load_settings().await?)
    }

    async fn update(&self, mutate: SettingsMutation) -> skiff_core::Result<AppSettings> {
        Ok(self.update_settings(mutate).await?)
    }
}
