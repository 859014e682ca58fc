//! Diagnostics report and support bundle.
//!
//! ```text
//! skiff-diagnostics-<yyyyMMdd-HHmmss>.zip
//!   diagnostics.txt
//!   settings.redacted.json
//!   logs/*.log
//! ```

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use skiff_core::{AppSettings, ConnectionSnapshot};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Errors that can occur while exporting diagnostics.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, DiagnosticsError>;

/// Point-in-time view of the application for support requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub app_version: String,
    pub os: String,
    pub state: String,
    pub active_server_profile_id: Option<String>,
    pub active_pac_profile_id: Option<String>,
    pub socks_port: u16,
    pub pac_port: u16,
    pub recent_log_lines: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DiagnosticsSnapshot {
    /// Gathers settings, connection state and the tail of the newest log.
    pub fn collect(
        settings: &AppSettings,
        connection: &ConnectionSnapshot,
        logs_dir: &Path,
        tail_lines: usize,
    ) -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            state: connection.state.to_string(),
            active_server_profile_id: settings.active_server_profile_id.clone(),
            active_pac_profile_id: settings.active_pac_profile_id.clone(),
            socks_port: settings.ports.socks_port,
            pac_port: settings.ports.pac_port,
            recent_log_lines: recent_log_lines(logs_dir, tail_lines),
            created_at: Utc::now(),
        }
    }

    /// Renders `Key: value` lines followed by the recent log lines.
    pub fn report_text(&self) -> String {
        let mut lines = vec![
            format!("GeneratedAtUtc: {}", self.created_at.to_rfc3339()),
            format!("AppVersion: {}", self.app_version),
            format!("OS: {}", self.os),
            format!("State: {}", self.state),
            format!(
                "ActiveServerProfileId: {}",
                self.active_server_profile_id.as_deref().unwrap_or_default()
            ),
            format!(
                "ActivePacProfileId: {}",
                self.active_pac_profile_id.as_deref().unwrap_or_default()
            ),
            format!("SocksPort: {}", self.socks_port),
            format!("PacPort: {}", self.pac_port),
            String::new(),
            "RecentLogs:".to_string(),
        ];
        lines.extend(self.recent_log_lines.iter().cloned());
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Bundle file name for this snapshot.
    pub fn bundle_name(&self) -> String {
        format!(
            "skiff-diagnostics-{}.zip",
            self.created_at.format("%Y%m%d-%H%M%S")
        )
    }
}

/// Last `max_lines` lines (at least one) of the newest `*.log` file.
pub fn recent_log_lines(logs_dir: &Path, max_lines: usize) -> Vec<String> {
    let Some(newest) = log_files(logs_dir)
        .into_iter()
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
    else {
        return Vec::new();
    };

    let Ok(content) = std::fs::read_to_string(&newest) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let keep = max_lines.max(1);
    lines[lines.len().saturating_sub(keep)..]
        .iter()
        .map(|line| line.to_string())
        .collect()
}

fn log_files(logs_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();
    files
}

/// Writes the support bundle into `output_dir` and returns its path.
///
/// Settings never contain passwords, so they are written as stored.
pub fn export_bundle(
    snapshot: &DiagnosticsSnapshot,
    settings: &AppSettings,
    logs_dir: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let bundle_path = output_dir.join(snapshot.bundle_name());

    let mut zip = ZipWriter::new(File::create(&bundle_path)?);
    let options = SimpleFileOptions::default();

    zip.start_file("settings.redacted.json", options)?;
    zip.write_all(serde_json::to_string_pretty(settings)?.as_bytes())?;

    for path in log_files(logs_dir) {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        zip.start_file(format!("logs/{name}"), options)?;
        zip.write_all(&std::fs::read(&path)?)?;
    }

    zip.start_file("diagnostics.txt", options)?;
    zip.write_all(snapshot.report_text().as_bytes())?;
    zip.finish()?;

    tracing::info!(path = %bundle_path.display(), "Diagnostics bundle exported");
    Ok(bundle_path)
}
