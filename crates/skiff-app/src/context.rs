//! Application wiring.
//!
//! ```text
//! AppPaths ─► JsonSettingsStore ─┐
//!          ─► FileSecretStore ───┤
//!          ─► SystemProxyManager ┼─► Collaborators ─► Orchestrator
//!          ─► PacManager ────────┤
//!   sslocal supervisor/provisioner
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use skiff_core::orchestrator::{ExecutableProvisioner, PacUpdate, ProcessSupervisor};
use skiff_core::{
    export_ss_uri, parse_ss_uri, AppSettings, Collaborators, LastGoodPac, Orchestrator,
    OrchestratorOptions, PacProfile, RoutingMode, ServerProfile, StandardValidator, TcpPortProbe,
};
use skiff_proxy::{
    platform_backend, HttpCache, PacManager, ProxySettingsBackend, SsLocalProvisioner,
    SsLocalSupervisor, SystemProxyManager,
};
use skiff_server::PacServer;
use skiff_storage::{AppPaths, FileSecretStore, JsonSettingsStore};
use tracing::{error, info, warn};

/// Everything the CLI commands operate on.
pub struct AppContext {
    pub paths: AppPaths,
    pub settings: Arc<JsonSettingsStore>,
    pub secrets: Arc<FileSecretStore>,
    pub system_proxy: Arc<SystemProxyManager>,
    pub pac: Arc<PacManager>,
    pub orchestrator: Orchestrator,
}

impl AppContext {
    /// Production wiring: the platform proxy backend and the real `sslocal`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(paths: AppPaths) -> anyhow::Result<Self> {
        let provisioner =
            SsLocalProvisioner::new().context("Failed to set up the sslocal provisioner")?;
        Self::assemble(
            paths,
            platform_backend(),
            Arc::new(SsLocalSupervisor::new()),
            Arc::new(provisioner),
        )
    }

    /// Wires the collaborators around the given engine and proxy backend.
    pub fn assemble(
        paths: AppPaths,
        backend: Arc<dyn ProxySettingsBackend>,
        supervisor: Arc<dyn ProcessSupervisor>,
        provisioner: Arc<dyn ExecutableProvisioner>,
    ) -> anyhow::Result<Self> {
        Self::assemble_with_options(
            paths,
            backend,
            supervisor,
            provisioner,
            OrchestratorOptions::default(),
        )
    }

    /// Like [`AppContext::assemble`] with explicit orchestrator timeouts.
    ///
    /// The runtime directory always comes from `paths`.
    pub fn assemble_with_options(
        paths: AppPaths,
        backend: Arc<dyn ProxySettingsBackend>,
        supervisor: Arc<dyn ProcessSupervisor>,
        provisioner: Arc<dyn ExecutableProvisioner>,
        options: OrchestratorOptions,
    ) -> anyhow::Result<Self> {
        paths.ensure_created()?;

        let settings = Arc::new(JsonSettingsStore::new(&paths.settings_file));
        let secrets = Arc::new(FileSecretStore::new(&paths.secrets));
        let system_proxy = Arc::new(SystemProxyManager::new(backend, paths.proxy_snapshot_file()));
        let cache = Arc::new(HttpCache::new(paths.http_cache())?);
        let pac = Arc::new(PacManager::new(
            Arc::new(PacServer::new()),
            cache,
            Arc::new(LastGoodPac::new()),
        ));

        let deps = Collaborators {
            settings: settings.clone(),
            validator: Arc::new(StandardValidator),
            secrets: secrets.clone(),
            supervisor,
            proxy: system_proxy.clone(),
            pac: pac.clone(),
            ports: Arc::new(TcpPortProbe),
            provisioner,
        };
        let options = options.with_runtime_dir(&paths.runtime);
        let orchestrator = Orchestrator::new(deps, options);

        info!(root = %paths.root.display(), "Application context ready");
        Ok(Self {
            paths,
            settings,
            secrets,
            system_proxy,
            pac,
            orchestrator,
        })
    }

    pub async fn load_settings(&self) -> anyhow::Result<AppSettings> {
        Ok(self.settings.load_settings().await?)
    }

    /// Settings plus the active PAC profile.
    pub async fn active_pac_profile(&self) -> anyhow::Result<(AppSettings, PacProfile)> {
        let settings = self.load_settings().await?;
        let profile = settings
            .active_pac_profile()
            .cloned()
            .ok_or_else(|| anyhow!("Active PAC profile is not configured."))?;
        Ok((settings, profile))
    }

    /// Regenerates the managed script for the active PAC profile.
    pub async fn regenerate_pac(&self) -> anyhow::Result<PacUpdate> {
        let (settings, profile) = self.active_pac_profile().await?;
        Ok(self.pac.update(&profile, settings.ports.socks_port).await)
    }

    /// Adds a server from an `ss://` URI and stores its password.
    pub async fn import_server(&self, uri: &str, activate: bool) -> anyhow::Result<ServerProfile> {
        let (profile, password) = parse_ss_uri(uri)?;
        self.secrets
            .save_secret(&profile.password_secret_id, &password)
            .await?;

        let added = profile.clone();
        self.settings
            .update_settings(move |settings| {
                if activate {
                    settings.active_server_profile_id = Some(added.id.clone());
                }
                settings.server_profiles.push(added);
            })
            .await?;

        info!(id = %profile.id, name = %profile.name, activate, "Server profile imported");
        Ok(profile)
    }

    /// Formats a stored server profile as an `ss://` URI.
    pub async fn export_server(&self, id: &str) -> anyhow::Result<String> {
        let settings = self.load_settings().await?;
        let profile = settings
            .server_profile(id)
            .ok_or_else(|| anyhow!("Server profile not found: {id}"))?;
        let password = self
            .secrets
            .read_secret(&profile.password_secret_id)
            .await?
            .ok_or_else(|| anyhow!("Server password is missing in secure storage."))?;
        Ok(export_ss_uri(profile, &password))
    }

    /// Disconnects through the queue, falling back to a direct rollback when
    /// the disconnect fails or takes longer than `timeout`.
    pub async fn shutdown_tunnel(&self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.orchestrator.disconnect()).await {
            Ok(result) if result.success() => return,
            Ok(result) => warn!("Disconnect reported: {}, rolling back directly", result.message),
            Err(_) => error!("Orchestrator unresponsive, rolling back directly"),
        }
        self.orchestrator.emergency_rollback().await;
    }

    /// Persists the routing mode.
    pub async fn set_routing_mode(&self, mode: RoutingMode) -> anyhow::Result<AppSettings> {
        let settings = self.load_settings().await?;
        if mode == RoutingMode::Pac && settings.active_pac_profile().is_none() {
            bail!("PAC routing requires an active PAC profile.");
        }
        let updated = self
            .settings
            .update_settings(move |settings| settings.routing_mode = mode)
            .await?;
        info!(mode = %mode, "Routing mode saved");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use secrecy::{ExposeSecret, SecretString};
    use skiff_core::orchestrator::{LaunchInfo, LaunchRequest, ProcessExit};
    use skiff_core::ConnectionState;
    use skiff_proxy::{InMemoryBackend, ProxySettings};
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use tokio_test::assert_ok;

    use super::*;

    struct FakeSupervisor {
        running: AtomicBool,
        socks_port: AtomicU16,
        exits: broadcast::Sender<ProcessExit>,
    }

    impl FakeSupervisor {
        fn new() -> Self {
            let (exits, _) = broadcast::channel(4);
            Self {
                running: AtomicBool::new(false),
                socks_port: AtomicU16::new(0),
                exits,
            }
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn start(&self, request: LaunchRequest) -> skiff_core::Result<LaunchInfo> {
            self.running.store(true, Ordering::SeqCst);
            self.socks_port.store(request.ports.socks, Ordering::SeqCst);
            Ok(LaunchInfo {
                pid: Some(7),
                started_at: Utc::now(),
                config_path: request.work_dir.join("sslocal.json"),
            })
        }

        async fn stop(&self, _graceful: Duration) -> skiff_core::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_for_port(&self, _port: u16, _timeout: Duration) -> bool {
            true
        }

        fn process_id(&self) -> Option<u32> {
            self.running.load(Ordering::SeqCst).then_some(7)
        }

        fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
            self.exits.subscribe()
        }
    }

    struct FakeProvisioner;

    #[async_trait]
    impl ExecutableProvisioner for FakeProvisioner {
        async fn ensure_available(
            &self,
            _configured: Option<&std::path::Path>,
        ) -> skiff_core::Result<std::path::PathBuf> {
            Ok(std::path::PathBuf::from("sslocal"))
        }
    }

    fn original_settings() -> ProxySettings {
        ProxySettings {
            proxy_enable: 1,
            proxy_server: Some("corp-proxy:3128".into()),
            proxy_override: Some("<local>".into()),
            auto_config_url: None,
            auto_detect: 1,
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    struct Harness {
        _temp: TempDir,
        backend: Arc<InMemoryBackend>,
        supervisor: Arc<FakeSupervisor>,
        ctx: AppContext,
    }

    async fn harness(mode: RoutingMode) -> Harness {
        harness_with_options(mode, OrchestratorOptions::default()).await
    }

    async fn harness_with_options(mode: RoutingMode, options: OrchestratorOptions) -> Harness {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::with_settings(original_settings()));
        let supervisor = Arc::new(FakeSupervisor::new());
        let ctx = AppContext::assemble_with_options(
            AppPaths::under(temp.path()),
            backend.clone(),
            supervisor.clone(),
            Arc::new(FakeProvisioner),
            options,
        )
        .unwrap();

        assert_ok!(
            ctx.import_server("ss://aes-256-gcm:secret@203.0.113.9:8388#Test", true)
                .await
        );
        let pac_port = free_port();
        assert_ok!(
            ctx.settings
                .update_settings(move |s| {
                    s.routing_mode = mode;
                    s.ports.pac_port = pac_port;
                })
                .await
        );

        Harness {
            _temp: temp,
            backend,
            supervisor,
            ctx,
        }
    }

    #[tokio::test]
    async fn test_global_connect_and_disconnect_restore_os_settings() {
        let h = harness(RoutingMode::Global).await;

        let result = h.ctx.orchestrator.connect().await;
        assert!(result.success(), "{}", result.message);
        assert_eq!(h.ctx.orchestrator.snapshot().state, ConnectionState::Connected);
        assert!(h.ctx.paths.proxy_snapshot_file().is_file());

        let socks = h.supervisor.socks_port.load(Ordering::SeqCst);
        let applied = h.backend.current();
        assert_eq!(applied.proxy_enable, 1);
        assert_eq!(applied.proxy_server, Some(format!("socks=127.0.0.1:{socks}")));
        assert_eq!(applied.proxy_override.as_deref(), Some("<local>;127.*;localhost"));
        assert_eq!(applied.auto_config_url, None);
        assert_eq!(applied.auto_detect, 0);

        let result = h.ctx.orchestrator.disconnect().await;
        assert!(result.success(), "{}", result.message);
        assert_eq!(h.backend.current(), original_settings());
        assert!(!h.ctx.paths.proxy_snapshot_file().exists());

        h.ctx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_pac_connect_serves_managed_script() {
        let h = harness(RoutingMode::Pac).await;

        let result = h.ctx.orchestrator.connect().await;
        assert!(result.success(), "{}", result.message);

        let applied = h.backend.current();
        assert_eq!(applied.proxy_enable, 0);
        assert_eq!(applied.proxy_server, None);
        let uri = applied.auto_config_url.expect("PAC URL applied");
        assert!(uri.starts_with("http://127.0.0.1:"));
        assert!(uri.contains("/proxy.pac?v="));
        assert!(h.ctx.pac.server().is_running().await);
        assert!(h.ctx.pac.preview().contains("example.com"));

        let result = h.ctx.orchestrator.disconnect().await;
        assert!(result.success(), "{}", result.message);
        assert!(!h.ctx.pac.server().is_running().await);
        assert_eq!(h.backend.current(), original_settings());

        h.ctx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_apply_leaves_os_settings_restored() {
        for mode in [RoutingMode::Global, RoutingMode::Pac] {
            let options =
                OrchestratorOptions::default().with_proxy_apply_timeout(Duration::from_millis(50));
            let h = harness_with_options(mode, options).await;
            h.backend.set_write_delay(Duration::from_millis(300));

            let result = h.ctx.orchestrator.connect().await;
            assert!(!result.success());
            assert_eq!(result.message, "Applying routing timed out after 50 ms.");
            assert_eq!(h.ctx.orchestrator.snapshot().state, ConnectionState::Faulted);

            // Give the abandoned write time to land if it were not serialized.
            tokio::time::sleep(Duration::from_millis(500)).await;

            assert_eq!(h.backend.current(), original_settings(), "{mode}");
            assert!(!h.ctx.paths.proxy_snapshot_file().exists());
            assert!(!h.ctx.system_proxy.is_session_active().await);
            assert!(!h.supervisor.running.load(Ordering::SeqCst));
            assert!(!h.ctx.pac.server().is_running().await);

            h.ctx.orchestrator.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_tunnel_disconnects() {
        let h = harness(RoutingMode::Global).await;
        assert!(h.ctx.orchestrator.connect().await.success());

        h.ctx.shutdown_tunnel(Duration::from_secs(30)).await;
        assert_eq!(h.ctx.orchestrator.snapshot().state, ConnectionState::Disconnected);
        assert_eq!(h.backend.current(), original_settings());
        assert!(!h.supervisor.running.load(Ordering::SeqCst));

        h.ctx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_tunnel_rolls_back_without_queue() {
        let h = harness(RoutingMode::Pac).await;
        assert!(h.ctx.orchestrator.connect().await.success());
        h.ctx.orchestrator.shutdown().await;

        h.ctx.shutdown_tunnel(Duration::from_secs(30)).await;
        assert_eq!(h.backend.current(), original_settings());
        assert!(!h.ctx.paths.proxy_snapshot_file().exists());
        assert!(!h.ctx.pac.server().is_running().await);
    }

    #[tokio::test]
    async fn test_recover_restores_left_over_record() {
        let h = harness(RoutingMode::Global).await;
        assert!(h.ctx.orchestrator.connect().await.success());

        // Simulate a crash: a new context over the same directory and backend.
        let ctx = AppContext::assemble(
            h.ctx.paths.clone(),
            h.backend.clone(),
            Arc::new(FakeSupervisor::new()),
            Arc::new(FakeProvisioner),
        )
        .unwrap();
        let result = ctx.orchestrator.recover_proxy().await;
        assert!(result.success(), "{}", result.message);
        assert_eq!(h.backend.current(), original_settings());

        ctx.orchestrator.shutdown().await;
        h.ctx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_export_round_trip() {
        let h = harness(RoutingMode::Off).await;
        let settings = h.ctx.load_settings().await.unwrap();
        let profile = settings.active_server_profile().unwrap().clone();
        assert_eq!(profile.name, "Test");
        assert_eq!(profile.host, "203.0.113.9");

        let password = h
            .ctx
            .secrets
            .read_secret(&profile.password_secret_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(password.expose_secret(), "secret");

        let uri = h.ctx.export_server(&profile.id).await.unwrap();
        let (reparsed, password) = parse_ss_uri(&uri).unwrap();
        assert_eq!(reparsed.host, profile.host);
        assert_eq!(reparsed.method, "aes-256-gcm");
        assert_eq!(password.expose_secret(), SecretString::from("secret").expose_secret());

        assert!(h.ctx.export_server("missing").await.is_err());
        h.ctx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_routing_mode_is_persisted() {
        let h = harness(RoutingMode::Off).await;
        let updated = h.ctx.set_routing_mode(RoutingMode::Pac).await.unwrap();
        assert_eq!(updated.routing_mode, RoutingMode::Pac);
        assert_eq!(h.ctx.load_settings().await.unwrap().routing_mode, RoutingMode::Pac);

        let update = h.ctx.regenerate_pac().await.unwrap();
        assert!(update.applied, "{}", update.message);
        h.ctx.orchestrator.shutdown().await;
    }
}
