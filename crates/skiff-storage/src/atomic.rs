//! Atomic file replacement.

use std::path::Path;

use tokio::fs;

use crate::error::Result;

/// Writes `contents` to a sibling temp file, then renames it over `path`.
///
/// Readers see either the old file or the complete new one.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let temp = path.with_file_name(format!("{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    if let Err(e) = fs::write(&temp, contents).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
