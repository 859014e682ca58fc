//! File-backed secret store.
//!
//! One file per secret id under the secrets directory. Values are base64
//! encoded; at-rest encryption is left to the OS account (files are 0600 on
//! Unix).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use skiff_core::orchestrator::SecretStore;
use tracing::debug;

use crate::atomic::write_atomic;
use crate::error::{Result, StorageError};

/// Secrets stored as files.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.bin")))
    }

    pub async fn read_secret(&self, id: &str) -> Result<Option<SecretString>> {
        let path = self.path_for(id)?;
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StorageError::CorruptSecret(format!("{id}: {e}")))?;
        let value = String::from_utf8(bytes)
            .map_err(|_| StorageError::CorruptSecret(format!("{id}: not UTF-8")))?;
        Ok(Some(SecretString::from(value)))
    }

    pub async fn save_secret(&self, id: &str, secret: &SecretString) -> Result<()> {
        let path = self.path_for(id)?;
        let encoded = STANDARD.encode(secret.expose_secret().as_bytes());
        write_atomic(&path, encoded.as_bytes()).await?;
        restrict_permissions(&path)?;
        debug!(id, "Secret saved");
        Ok(())
    }

    pub async fn delete_secret(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    let trimmed = id.trim();
    if trimmed.is_empty()
        || trimmed != id
        || id.contains("..")
        || id.contains('/')
        || id.contains('\\')
        || id.contains(':')
    {
        return Err(StorageError::InvalidSecretId(id.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn read(&self, id: &str) -> skiff_core::Result<Option<SecretString>> {
        Ok(self.read_secret(id).await?)
    }

    async fn save(&self, id: &str, secret: &SecretString) -> skiff_core::Result<()> {
        Ok(self.save_secret(id, secret).await?)
    }

    async fn delete(&self, id: &str) -> skiff_core::Result<()> {
        Ok(self.delete_secret(id).await?)
    }
}
