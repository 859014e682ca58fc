//! Locating, or on Windows downloading, the `sslocal` executable.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use skiff_core::orchestrator::ExecutableProvisioner;
use tokio::sync::Mutex;
use tracing::info;
use zip::ZipArchive;

use crate::error::{ProxyError, Result};

/// Latest shadowsocks-rust release.
pub const RELEASE_API_URL: &str =
    "https://api.github.com/repos/shadowsocks/shadowsocks-rust/releases/latest";

/// Release asset target.
pub const ASSET_TARGET: &str = "x86_64-pc-windows-msvc";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// File name of the executable on this platform.
pub fn binary_name() -> &'static str {
    if cfg!(windows) {
        "sslocal.exe"
    } else {
        "sslocal"
    }
}

/// Finds `sslocal`, downloading it into the tools directory when allowed.
pub struct SsLocalProvisioner {
    tools_dir: PathBuf,
    release_api: String,
    allow_download: bool,
    search_path: bool,
    client: reqwest::Client,
    gate: Mutex<()>,
}

impl SsLocalProvisioner {
    /// Uses `<exe-dir>/tools/sslocal`; downloads only on Windows.
    pub fn new() -> Result<Self> {
        let exe_dir = std::env::current_exe()?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::with_tools_dir(exe_dir.join("tools").join("sslocal"))
    }

    pub fn with_tools_dir(tools_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Skiff/{}", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self {
            tools_dir: tools_dir.into(),
            release_api: RELEASE_API_URL.to_string(),
            allow_download: cfg!(windows),
            search_path: true,
            client,
            gate: Mutex::new(()),
        })
    }

    pub fn with_release_api(mut self, url: impl Into<String>) -> Self {
        self.release_api = url.into();
        self
    }

    pub fn with_download(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    /// Whether `PATH` is searched.
    pub fn with_path_search(mut self, search: bool) -> Self {
        self.search_path = search;
        self
    }

    pub fn tools_path(&self) -> PathBuf {
        self.tools_dir.join(binary_name())
    }

    /// Resolves the executable.
    ///
    /// Order: configured path, tools directory, `PATH`, download.
    pub async fn locate(&self, configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured.filter(|p| p.is_file()) {
            return Ok(path.to_path_buf());
        }

        let bundled = self.tools_path();
        if bundled.is_file() {
            return Ok(bundled);
        }

        if self.search_path {
            if let Some(found) = find_on_path(binary_name()) {
                return Ok(found);
            }
        }

        if !self.allow_download {
            return Err(ProxyError::Process(format!(
                "sslocal executable was not found. Configure its path or place it at {}.",
                bundled.display()
            )));
        }

        let _guard = self.gate.lock().await;
        if bundled.is_file() {
            return Ok(bundled);
        }
        info!("sslocal not found, downloading from shadowsocks-rust releases");
        self.download_latest().await
    }

    /// Downloads the latest release archive and extracts the executable.
    pub async fn download_latest(&self) -> Result<PathBuf> {
        let release: Release = self
            .client
            .get(&self.release_api)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let asset = release
            .assets
            .iter()
            .find(|a| {
                let name = a.name.to_ascii_lowercase();
                name.contains(ASSET_TARGET) && name.ends_with(".zip")
            })
            .ok_or_else(|| {
                ProxyError::Process(format!("No {ASSET_TARGET} asset in the latest release."))
            })?;

        info!(url = %asset.browser_download_url, "Downloading sslocal");
        let archive = self
            .client
            .get(&asset.browser_download_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let binary = extract_binary(&archive, binary_name())?;
        let target = self.tools_path();
        skiff_storage::write_atomic(&target, &binary).await?;
        make_executable(&target).await?;
        info!(path = %target.display(), "sslocal extracted");
        Ok(target)
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Pulls `name` out of a zip archive, wherever it sits.
fn extract_binary(data: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).map_err(|e| ProxyError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ProxyError::Archive(e.to_string()))?;
        let matches = Path::new(entry.name())
            .file_name()
            .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(name));
        if matches {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(ProxyError::Archive(format!("{name} not found inside the downloaded archive")))
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl ExecutableProvisioner for SsLocalProvisioner {
    async fn ensure_available(&self, configured: Option<&Path>) -> skiff_core::Result<PathBuf> {
        Ok(self.locate(configured).await?)
    }
}
