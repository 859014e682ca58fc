//! Transactional system proxy configuration.
//!
//! ```text
//! begin_session ──► capture OS settings ──► state/proxy_snapshot.json
//!        │
//!        ▼
//! apply_routing_mode (Off | Global | Pac) ──► backend.write + refresh
//!        │
//!        ▼
//! rollback ──► restore snapshot ──► delete record
//! ```
//!
//! The record on disk outlives the process: if it is still there at the
//! next start, [`SystemProxyManager::crash_recover_if_needed`] restores it.

mod memory;

#[cfg(target_os = "linux")]
mod gnome;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_core::orchestrator::{ResolvedPorts, SystemProxy};
use skiff_core::RoutingMode;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::error::{ProxyError, Result};

pub use memory::InMemoryBackend;

/// Bypass list written in global mode.
pub const GLOBAL_BYPASS: &str = "<local>;127.*;localhost";

/// OS proxy settings the manager reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub proxy_enable: u32,
    pub proxy_server: Option<String>,
    pub proxy_override: Option<String>,
    pub auto_config_url: Option<String>,
    pub auto_detect: u32,
}

/// Settings captured before a session, as persisted in the recovery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    #[serde(flatten)]
    pub settings: ProxySettings,
    pub captured_at: DateTime<Utc>,
}

impl ProxySnapshot {
    pub fn capture(settings: ProxySettings) -> Self {
        Self {
            settings,
            captured_at: Utc::now(),
        }
    }
}

/// Platform access to the OS-wide proxy configuration.
pub trait ProxySettingsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self) -> Result<ProxySettings>;

    fn write(&self, settings: &ProxySettings) -> Result<()>;

    /// Makes running applications pick up the new settings.
    fn refresh(&self) -> Result<()>;
}

/// Backend for the current platform.
pub fn platform_backend() -> Arc<dyn ProxySettingsBackend> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(windows::RegistryBackend::new())
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::NetworkSetupBackend::new())
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(gnome::GnomeBackend::new())
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        warn!("No system proxy backend for this platform, changes stay in memory");
        Arc::new(InMemoryBackend::new())
    }
}

/// Rewrites `current` for a routing mode.
pub fn settings_for_mode(
    current: &ProxySettings,
    mode: RoutingMode,
    socks_port: u16,
    pac_uri: Option<&str>,
) -> Result<ProxySettings> {
    let mut next = current.clone();
    match mode {
        RoutingMode::Off => {
            next.proxy_enable = 0;
            next.proxy_server = None;
            next.proxy_override = None;
            next.auto_config_url = None;
        }
        RoutingMode::Global => {
            next.proxy_enable = 1;
            next.proxy_server = Some(format!("socks=127.0.0.1:{socks_port}"));
            next.proxy_override = Some(GLOBAL_BYPASS.to_string());
            next.auto_config_url = None;
            next.auto_detect = 0;
        }
        RoutingMode::Pac => {
            let uri = pac_uri
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| ProxyError::Session("PAC URI is required for PAC mode.".into()))?;
            next.proxy_enable = 0;
            next.proxy_server = None;
            next.proxy_override = None;
            next.auto_config_url = Some(uri.to_string());
            next.auto_detect = 0;
        }
    }
    Ok(next)
}

/// Splits `socks=host:port` (or `host:port`) into its parts.
pub(crate) fn parse_socks_server(value: &str) -> Option<(String, u16)> {
    let address = value
        .split(';')
        .find_map(|part| part.trim().strip_prefix("socks="))
        .unwrap_or(value)
        .trim();
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    (!host.is_empty()).then(|| (host.to_string(), port))
}

#[derive(Default)]
struct Session {
    snapshot: Option<ProxySnapshot>,
    started: bool,
}

/// Captures, mutates and restores the OS proxy configuration.
///
/// Backend writes own the session guard, so a caller that gives up on a
/// slow write still blocks the next operation until the write lands.
pub struct SystemProxyManager {
    backend: Arc<dyn ProxySettingsBackend>,
    record_path: PathBuf,
    session: Arc<Mutex<Session>>,
}

impl SystemProxyManager {
    pub fn new(backend: Arc<dyn ProxySettingsBackend>, record_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            record_path: record_path.into(),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub async fn is_session_active(&self) -> bool {
        self.session.lock().await.started
    }

    /// Restores the recovery record left by a crashed run.
    pub async fn crash_recover_if_needed(&self) -> Result<bool> {
        let session = self.lock_session().await;

        let snapshot = match self.read_record().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(error = %e, path = %self.record_path.display(), "Proxy recovery record cannot be parsed, deleting it");
                self.delete_record().await?;
                return Ok(false);
            }
        };

        warn!(captured_at = %snapshot.captured_at, "Detected dirty proxy state, running crash recovery");
        let mut session = match self.restore(session, &snapshot.settings).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Crash recovery failed");
                return Err(e);
            }
        };
        self.delete_record().await?;
        *session = Session::default();
        Ok(true)
    }

    /// Captures the current settings and persists them before any change.
    pub async fn begin_session(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.started {
            return Ok(());
        }

        let current = self.call(|b| b.read()).await?;
        let snapshot = ProxySnapshot::capture(current);
        let json = serde_json::to_vec_pretty(&snapshot)?;
        skiff_storage::write_atomic(&self.record_path, &json).await?;

        session.snapshot = Some(snapshot);
        session.started = true;
        info!(backend = self.backend.name(), "System proxy transaction started");
        Ok(())
    }

    pub async fn apply_routing_mode(
        &self,
        mode: RoutingMode,
        socks_port: u16,
        pac_uri: Option<&str>,
    ) -> Result<()> {
        let session = self.lock_session().await;
        if mode != RoutingMode::Off && !session.started {
            return Err(ProxyError::Session(
                "Proxy session is not started. Call begin_session first.".into(),
            ));
        }

        let pac_uri = pac_uri.map(str::to_owned);
        let result = self
            .call_locked(session, move |backend| {
                let current = backend.read()?;
                let next = settings_for_mode(&current, mode, socks_port, pac_uri.as_deref())?;
                backend.write(&next)?;
                backend.refresh()
            })
            .await
            .map(|((), _session)| ());

        match &result {
            Ok(()) => info!(mode = %mode, "System proxy mode applied"),
            Err(e) => error!(mode = %mode, error = %e, "Failed to apply proxy mode"),
        }
        result
    }

    /// Restores the captured settings and ends the session.
    pub async fn rollback(&self) -> Result<()> {
        let session = self.lock_session().await;

        let snapshot = match session.snapshot.clone() {
            Some(snapshot) => Some(snapshot),
            None => self.read_record().await?,
        };
        let Some(snapshot) = snapshot else {
            info!("Rollback skipped: no active proxy snapshot");
            return Ok(());
        };

        let mut session = match self.restore(session, &snapshot.settings).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "System proxy rollback failed");
                return Err(e);
            }
        };
        self.delete_record().await?;
        *session = Session::default();
        info!("System proxy rollback complete");
        Ok(())
    }

    async fn restore(
        &self,
        session: OwnedMutexGuard<Session>,
        settings: &ProxySettings,
    ) -> Result<OwnedMutexGuard<Session>> {
        let settings = settings.clone();
        let ((), session) = self
            .call_locked(session, move |backend| {
                backend.write(&settings)?;
                backend.refresh()
            })
            .await?;
        Ok(session)
    }

    async fn lock_session(&self) -> OwnedMutexGuard<Session> {
        Arc::clone(&self.session).lock_owned().await
    }

    /// Runs a mutating backend call that holds the session until it returns.
    ///
    /// The blocking task owns the guard, so dropping the returned future
    /// does not release the session while a write is still in flight.
    async fn call_locked<T, F>(
        &self,
        session: OwnedMutexGuard<Session>,
        f: F,
    ) -> Result<(T, OwnedMutexGuard<Session>)>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProxySettingsBackend) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(backend.as_ref()).map(|value| (value, session)))
            .await
            .map_err(|e| ProxyError::Backend(format!("backend task failed: {e}")))?
    }

    /// Runs a backend call off the async runtime.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProxySettingsBackend) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(backend.as_ref()))
            .await
            .map_err(|e| ProxyError::Backend(format!("backend task failed: {e}")))?
    }

    async fn read_record(&self) -> Result<Option<ProxySnapshot>> {
        match tokio::fs::read(&self.record_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_record(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.record_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SystemProxy for SystemProxyManager {
    async fn crash_recover_if_needed(&self) -> skiff_core::Result<bool> {
        Ok(SystemProxyManager::crash_recover_if_needed(self).await?)
    }

    async fn begin_session(&self) -> skiff_core::Result<()> {
        Ok(SystemProxyManager::begin_session(self).await?)
    }

    async fn apply_routing_mode(
        &self,
        mode: RoutingMode,
        ports: &ResolvedPorts,
        pac_uri: Option<&str>,
    ) -> skiff_core::Result<()> {
        Ok(SystemProxyManager::apply_routing_mode(self, mode, ports.socks, pac_uri).await?)
    }

    async fn rollback(&self) -> skiff_core::Result<()> {
        Ok(SystemProxyManager::rollback(self).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn user_settings() -> ProxySettings {
        ProxySettings {
            proxy_enable: 1,
            proxy_server: Some("corp-proxy:3128".into()),
            proxy_override: Some("*.corp".into()),
            auto_config_url: None,
            auto_detect: 1,
        }
    }

    fn manager(temp: &TempDir, backend: Arc<InMemoryBackend>) -> SystemProxyManager {
        SystemProxyManager::new(backend, temp.path().join("state").join("proxy_snapshot.json"))
    }

    #[test]
    fn test_mode_mapping() {
        let current = user_settings();

        let off = settings_for_mode(&current, RoutingMode::Off, 1080, None).unwrap();
        assert_eq!(off.proxy_enable, 0);
        assert!(off.proxy_server.is_none() && off.proxy_override.is_none());
        assert!(off.auto_config_url.is_none());
        assert_eq!(off.auto_detect, 1);

        let global = settings_for_mode(&current, RoutingMode::Global, 1080, None).unwrap();
        assert_eq!(global.proxy_enable, 1);
        assert_eq!(global.proxy_server.as_deref(), Some("socks=127.0.0.1:1080"));
        assert_eq!(global.proxy_override.as_deref(), Some(GLOBAL_BYPASS));
        assert_eq!(global.auto_detect, 0);

        let pac = settings_for_mode(&current, RoutingMode::Pac, 1080, Some("http://127.0.0.1:8090/proxy.pac?v=1")).unwrap();
        assert_eq!(pac.proxy_enable, 0);
        assert!(pac.proxy_server.is_none());
        assert_eq!(pac.auto_config_url.as_deref(), Some("http://127.0.0.1:8090/proxy.pac?v=1"));

        assert!(settings_for_mode(&current, RoutingMode::Pac, 1080, None).is_err());
        assert!(settings_for_mode(&current, RoutingMode::Pac, 1080, Some(" ")).is_err());
    }

    #[test]
    fn test_parse_socks_server() {
        assert_eq!(parse_socks_server("socks=127.0.0.1:1080"), Some(("127.0.0.1".into(), 1080)));
        assert_eq!(parse_socks_server("http=a:1;socks=b:2"), Some(("b".into(), 2)));
        assert_eq!(parse_socks_server("host:99"), Some(("host".into(), 99)));
        assert_eq!(parse_socks_server("nonsense"), None);
    }

    #[test]
    fn test_record_json_shape() {
        let snapshot = ProxySnapshot::capture(user_settings());
        let json: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["proxy_enable"], 1);
        assert_eq!(json["proxy_server"], "corp-proxy:3128");
        assert_eq!(json["auto_detect"], 1);
        assert!(json["captured_at"].is_string());
    }

    #[tokio::test]
    async fn test_session_apply_and_rollback() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        let err = manager.apply_routing_mode(RoutingMode::Global, 1080, None).await;
        assert!(err.is_err());

        manager.begin_session().await.unwrap();
        assert!(manager.record_path().exists());
        manager.begin_session().await.unwrap();

        manager.apply_routing_mode(RoutingMode::Global, 1080, None).await.unwrap();
        let applied = backend.current();
        assert_eq!(applied.proxy_enable, 1);
        assert_eq!(applied.proxy_server.as_deref(), Some("socks=127.0.0.1:1080"));
        assert!(applied.auto_config_url.is_none());
        assert!(backend.refresh_count() >= 1);

        manager.rollback().await.unwrap();
        assert_eq!(backend.current(), user_settings());
        assert!(!manager.record_path().exists());
        assert!(!manager.is_session_active().await);
    }

    #[tokio::test]
    async fn test_off_does_not_need_session() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        manager.apply_routing_mode(RoutingMode::Off, 1080, None).await.unwrap();
        assert_eq!(backend.current().proxy_enable, 0);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_is_noop() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        manager.rollback().await.unwrap();
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_crash_recovery_restores_record() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));

        {
            let crashed = manager(&temp, backend.clone());
            crashed.begin_session().await.unwrap();
            crashed.apply_routing_mode(RoutingMode::Global, 1080, None).await.unwrap();
        }
        assert_eq!(backend.current().proxy_enable, 1);

        let restarted = manager(&temp, backend.clone());
        assert!(restarted.crash_recover_if_needed().await.unwrap());
        assert_eq!(backend.current(), user_settings());
        assert!(!restarted.record_path().exists());

        assert!(!restarted.crash_recover_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_after_restart_uses_record() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));

        let first = manager(&temp, backend.clone());
        first.begin_session().await.unwrap();
        first.apply_routing_mode(RoutingMode::Global, 1080, None).await.unwrap();

        let second = manager(&temp, backend.clone());
        second.rollback().await.unwrap();
        assert_eq!(backend.current(), user_settings());
        assert!(!second.record_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_deleted() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        std::fs::create_dir_all(manager.record_path().parent().unwrap()).unwrap();
        std::fs::write(manager.record_path(), b"{not json").unwrap();

        assert!(!manager.crash_recover_if_needed().await.unwrap());
        assert!(!manager.record_path().exists());
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_waits_for_abandoned_write() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        manager.begin_session().await.unwrap();
        backend.set_write_delay(Duration::from_millis(300));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            manager.apply_routing_mode(RoutingMode::Global, 1080, None),
        )
        .await;
        assert!(abandoned.is_err());

        manager.rollback().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(backend.current(), user_settings());
        assert_eq!(backend.write_count(), 2);
        assert!(!manager.is_session_active().await);
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(user_settings()));
        let manager = manager(&temp, backend.clone());

        manager.begin_session().await.unwrap();
        backend.fail_writes(true);
        let err = manager
            .apply_routing_mode(RoutingMode::Global, 1080, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Backend(_)));
    }
}
