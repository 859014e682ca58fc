use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio_test::assert_ok;

use super::*;
use crate::models::{PacProfile, ServerProfile};
use crate::ports::PortAllocator;
use crate::validation::StandardValidator;

// ── Fakes ────────────────────────────────────────────────────────────

struct FakeSettings {
    settings: Mutex<AppSettings>,
}

#[async_trait]
impl SettingsProvider for FakeSettings {
    async fn load(&self) -> Result<AppSettings> {
        Ok(self.settings.lock().clone())
    }

    async fn update(&self, mutate: SettingsMutation) -> Result<AppSettings> {
        let mut settings = self.settings.lock();
        mutate(&mut settings);
        Ok(settings.clone())
    }
}

#[derive(Default)]
struct FakeSecrets {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn read(&self, id: &str) -> Result<Option<SecretString>> {
        Ok(self.values.lock().get(id).map(|v| SecretString::from(v.clone())))
    }

    async fn save(&self, id: &str, secret: &SecretString) -> Result<()> {
        self.values
            .lock()
            .insert(id.to_string(), secret.expose_secret().to_string());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.values.lock().remove(id);
        Ok(())
    }
}

struct FakeSupervisor {
    starts: AtomicUsize,
    stops: AtomicUsize,
    port_ready: AtomicBool,
    running: AtomicBool,
    exit_tx: broadcast::Sender<ProcessExit>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        let (exit_tx, _) = broadcast::channel(8);
        Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            port_ready: AtomicBool::new(true),
            running: AtomicBool::new(false),
            exit_tx,
        }
    }
}

impl FakeSupervisor {
    fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.exit_tx.send(ProcessExit {
            exit_code: Some(1),
            reason: "sslocal exited unexpectedly".to_string(),
        });
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start(&self, request: LaunchRequest) -> Result<LaunchInfo> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(LaunchInfo {
            pid: Some(4242),
            started_at: Utc::now(),
            config_path: request.work_dir.join("sslocal.json"),
        })
    }

    async fn stop(&self, _graceful: Duration) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_port(&self, _port: u16, _timeout: Duration) -> bool {
        self.port_ready.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        self.running.load(Ordering::SeqCst).then_some(4242)
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.exit_tx.subscribe()
    }
}

#[derive(Default)]
struct FakeProxy {
    begins: AtomicUsize,
    rollbacks: AtomicUsize,
    recoveries: AtomicUsize,
    applied: Mutex<Vec<(RoutingMode, Option<String>)>>,
    fail_apply: AtomicBool,
}

#[async_trait]
impl SystemProxy for FakeProxy {
    async fn crash_recover_if_needed(&self) -> Result<bool> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn begin_session(&self) -> Result<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_routing_mode(
        &self,
        mode: RoutingMode,
        _ports: &ResolvedPorts,
        pac_uri: Option<&str>,
    ) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(CoreError::ProxyConfig("registry write denied".into()));
        }
        self.applied.lock().push((mode, pac_uri.map(str::to_string)));
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakePac {
    updates: AtomicUsize,
    resolves: AtomicUsize,
    stops: AtomicUsize,
    update_delay_ms: AtomicUsize,
    fail_stop: AtomicBool,
}

#[async_trait]
impl PacEngine for FakePac {
    async fn update_managed(&self, _profile: &PacProfile, _socks_port: u16) -> PacUpdate {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let delay = self.update_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        PacUpdate::applied(2)
    }

    async fn resolve_uri(&self, _profile: &PacProfile, _socks: u16, pac_port: u16) -> Result<String> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(format!("http://127.0.0.1:{pac_port}/proxy.pac?v=1"))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(CoreError::Pac("listener stuck".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakePorts {
    busy: HashSet<u16>,
}

impl PortAllocator for FakePorts {
    fn is_available(&self, port: u16) -> bool {
        !self.busy.contains(&port)
    }
}

struct FakeProvisioner;

#[async_trait]
impl ExecutableProvisioner for FakeProvisioner {
    async fn ensure_available(&self, _configured: Option<&Path>) -> Result<PathBuf> {
        Ok(PathBuf::from("/usr/bin/sslocal"))
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Orchestrator,
    settings: Arc<FakeSettings>,
    supervisor: Arc<FakeSupervisor>,
    proxy: Arc<FakeProxy>,
    pac: Arc<FakePac>,
}

fn settings_with(mode: RoutingMode) -> (AppSettings, String) {
    let server = ServerProfile::new("Tokyo", "203.0.113.10", 8388);
    let secret_id = server.password_secret_id.clone();
    let pac = PacProfile::managed("Managed", "||example.com");
    let settings = AppSettings {
        routing_mode: mode,
        active_server_profile_id: Some(server.id.clone()),
        active_pac_profile_id: Some(pac.id.clone()),
        server_profiles: vec![server],
        pac_profiles: vec![pac],
        ..AppSettings::default()
    };
    (settings, secret_id)
}

fn harness_with(settings: AppSettings, secret_id: Option<&str>, busy: &[u16]) -> Harness {
    let settings = Arc::new(FakeSettings {
        settings: Mutex::new(settings),
    });
    let secrets = Arc::new(FakeSecrets::default());
    if let Some(id) = secret_id {
        secrets.values.lock().insert(id.to_string(), "hunter2".to_string());
    }
    let supervisor = Arc::new(FakeSupervisor::default());
    let proxy = Arc::new(FakeProxy::default());
    let pac = Arc::new(FakePac::default());

    let deps = Collaborators {
        settings: settings.clone(),
        validator: Arc::new(StandardValidator),
        secrets,
        supervisor: supervisor.clone(),
        proxy: proxy.clone(),
        pac: pac.clone(),
        ports: Arc::new(FakePorts {
            busy: busy.iter().copied().collect(),
        }),
        provisioner: Arc::new(FakeProvisioner),
    };
    let options = OrchestratorOptions::default()
        .with_start_timeout(Duration::from_secs(2))
        .with_stop_timeout(Duration::from_secs(1));

    Harness {
        orchestrator: Orchestrator::new(deps, options),
        settings,
        supervisor,
        proxy,
        pac,
    }
}

fn harness(mode: RoutingMode) -> Harness {
    let (settings, secret_id) = settings_with(mode);
    harness_with(settings, Some(&secret_id), &[])
}

async fn wait_for_state(orchestrator: &Orchestrator, state: ConnectionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while orchestrator.snapshot().state != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "state never became {state}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_then_disconnect() {
    let h = harness(RoutingMode::Global);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.outcome, OrchestrationOutcome::Ok, "{result}");
    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.process_id, Some(4242));
    assert!(snapshot.active_server_id.is_some());
    assert_eq!(h.proxy.begins.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.applied.lock()[0], (RoutingMode::Global, None));

    let result = h.orchestrator.disconnect().await;
    assert_eq!(result.message, "Disconnected.");
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Disconnected);
    assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_cycles_stop_once_per_cycle() {
    let h = harness(RoutingMode::Off);
    for cycle in 1..=3 {
        assert!(h.orchestrator.connect().await.success());
        assert!(h.orchestrator.disconnect().await.success());
        assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), cycle);
        assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), cycle);
    }
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Disconnected);
    assert!(h.proxy.applied.lock().is_empty());
}

#[tokio::test]
async fn test_connect_when_connected_is_no_op() {
    let h = harness(RoutingMode::Off);
    assert!(h.orchestrator.connect().await.success());
    let again = h.orchestrator.connect().await;
    assert!(again.is_no_op());
    assert_eq!(again.message, "Already connected or connecting.");
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_when_disconnected_is_no_op() {
    let h = harness(RoutingMode::Off);
    assert!(h.orchestrator.disconnect().await.is_no_op());
    assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_toggle_dispatches_on_state() {
    let h = harness(RoutingMode::Off);
    assert_eq!(h.orchestrator.toggle().await.message, "Connected.");
    assert_eq!(h.orchestrator.toggle().await.message, "Disconnected.");
}

#[tokio::test]
async fn test_pac_mode_resolves_uri() {
    let h = harness(RoutingMode::Pac);
    assert!(h.orchestrator.connect().await.success());

    assert_eq!(h.pac.resolves.load(Ordering::SeqCst), 1);
    let applied = h.proxy.applied.lock().clone();
    assert_eq!(applied[0].0, RoutingMode::Pac);
    assert_eq!(applied[0].1.as_deref(), Some("http://127.0.0.1:8090/proxy.pac?v=1"));
    assert!(h.orchestrator.snapshot().active_pac_profile_id.is_some());
}

#[tokio::test]
async fn test_coalesced_update_pac() {
    let h = harness(RoutingMode::Off);
    h.pac.update_delay_ms.store(200, Ordering::SeqCst);

    let first = h
        .orchestrator
        .submit(OrchestratorCommand::UpdatePac, CancellationToken::new());
    let second = h
        .orchestrator
        .submit(OrchestratorCommand::UpdatePac, CancellationToken::new());

    assert!(second.is_ready());
    let second = second.wait().await;
    assert!(second.is_no_op());
    assert_eq!(second.message, "UpdatePac is already queued.");

    assert!(first.wait().await.success());
    assert_eq!(h.pac.updates.load(Ordering::SeqCst), 1);

    // Kind is released once the first run completes.
    assert!(h.orchestrator.update_pac().await.success());
    assert_eq!(h.pac.updates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_update_pac_chains_routing_when_connected() {
    let h = harness(RoutingMode::Pac);
    assert!(h.orchestrator.connect().await.success());

    let result = h.orchestrator.update_lists().await;
    assert_eq!(result.outcome, OrchestrationOutcome::Ok, "{result}");
    assert_eq!(h.proxy.applied.lock().len(), 2);
    assert_eq!(h.orchestrator.snapshot().message, "Routing mode applied: pac");
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_update_pac_without_profile_is_no_op() {
    let (mut settings, secret_id) = settings_with(RoutingMode::Off);
    settings.active_pac_profile_id = None;
    let h = harness_with(settings, Some(&secret_id), &[]);
    let result = h.orchestrator.update_pac().await;
    assert_eq!(result.message, "No active PAC profile.");
    assert!(result.is_no_op());
}

#[tokio::test]
async fn test_apply_routing_when_disconnected_is_no_op() {
    let h = harness(RoutingMode::Global);
    let result = h.orchestrator.apply_routing().await;
    assert!(result.is_no_op());
    assert_eq!(result.message, "Routing update saved, current state is not Connected.");
    assert!(h.proxy.applied.lock().is_empty());
}

#[tokio::test]
async fn test_apply_routing_switches_mode() {
    let h = harness(RoutingMode::Off);
    assert!(h.orchestrator.connect().await.success());

    assert_ok!(
        h.settings
            .update(Box::new(|s| s.routing_mode = RoutingMode::Global))
            .await
    );
    let result = h.orchestrator.apply_routing().await;
    assert_eq!(result.outcome, OrchestrationOutcome::Ok, "{result}");
    assert_eq!(h.proxy.begins.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.applied.lock()[0], (RoutingMode::Global, None));
}

#[tokio::test]
async fn test_port_never_opens_faults_and_rolls_back() {
    let h = harness(RoutingMode::Global);
    h.supervisor.port_ready.store(false, Ordering::SeqCst);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.outcome, OrchestrationOutcome::Failed);
    assert_eq!(result.message, "sslocal did not open localhost:1080 in time.");

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Faulted);
    assert_eq!(
        snapshot.message,
        "Connection failed: sslocal did not open localhost:1080 in time."
    );
    assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(h.pac.stops.load(Ordering::SeqCst), 1);
    assert!(h.proxy.applied.lock().is_empty());
}

#[tokio::test]
async fn test_proxy_failure_faults_and_stops_process() {
    let h = harness(RoutingMode::Global);
    h.proxy.fail_apply.store(true, Ordering::SeqCst);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.message, "registry write denied");
    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Faulted);
    assert!(snapshot.active_server_id.is_none());
    assert!(snapshot.active_pac_profile_id.is_none());
    assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);

    // Faulted allows a fresh connect.
    h.proxy.fail_apply.store(false, Ordering::SeqCst);
    assert!(h.orchestrator.connect().await.success());
}

#[tokio::test]
async fn test_busy_port_without_auto_select_fails_before_start() {
    let (mut settings, secret_id) = settings_with(RoutingMode::Off);
    settings.ports.auto_select_on_conflict = false;
    let h = harness_with(settings, Some(&secret_id), &[1080]);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.message, "Port 1080 is already in use.");
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Faulted);
}

#[tokio::test]
async fn test_busy_port_with_auto_select_uses_alternative() {
    let (mut settings, secret_id) = settings_with(RoutingMode::Pac);
    settings.ports.http_port = Some(1081);
    let h = harness_with(settings, Some(&secret_id), &[1080, 8090]);

    assert!(h.orchestrator.connect().await.success());
    let applied = h.proxy.applied.lock().clone();
    assert_eq!(applied[0].1.as_deref(), Some("http://127.0.0.1:8091/proxy.pac?v=1"));
}

#[tokio::test]
async fn test_missing_password_fails_before_start() {
    let (settings, _) = settings_with(RoutingMode::Off);
    let h = harness_with(settings, None, &[]);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.message, "Server password is missing in secure storage.");
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_server_profile_fails() {
    let (mut settings, secret_id) = settings_with(RoutingMode::Off);
    settings.active_server_profile_id = None;
    let h = harness_with(settings, Some(&secret_id), &[]);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.message, "Active server profile is not configured.");
}

#[tokio::test]
async fn test_invalid_settings_fail_with_all_errors() {
    let (mut settings, secret_id) = settings_with(RoutingMode::Off);
    settings.ports.socks_port = 0;
    settings.ports.pac_port = 0;
    let h = harness_with(settings, Some(&secret_id), &[]);

    let result = h.orchestrator.connect().await;
    assert_eq!(result.outcome, OrchestrationOutcome::Failed);
    assert_eq!(result.message.lines().count(), 2);
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unexpected_exit_faults_tunnel() {
    let h = harness(RoutingMode::Global);
    assert!(h.orchestrator.connect().await.success());

    h.supervisor.crash();
    wait_for_state(&h.orchestrator, ConnectionState::Faulted).await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.message, "sslocal exited unexpectedly");
    assert!(snapshot.active_server_id.is_none());
    assert!(snapshot.active_pac_profile_id.is_none());
    // Cleanup runs after the Faulted snapshot is published.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.pac.stops.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exit_while_disconnected_is_ignored() {
    let h = harness(RoutingMode::Off);
    let result = h
        .orchestrator
        .execute(
            OrchestratorCommand::FaultFromProcessExit("late exit".into()),
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_no_op());
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_errors_are_counted() {
    let h = harness(RoutingMode::Off);
    assert!(h.orchestrator.connect().await.success());
    h.pac.fail_stop.store(true, Ordering::SeqCst);

    let result = h.orchestrator.disconnect().await;
    assert_eq!(result.message, "Disconnect completed with 1 errors.");
    assert_eq!(h.orchestrator.snapshot().state, ConnectionState::Faulted);
    // The remaining steps still ran.
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(h.supervisor.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_token_skips_command() {
    let h = harness(RoutingMode::Off);
    let token = CancellationToken::new();
    token.cancel();

    let result = h.orchestrator.execute(OrchestratorCommand::Connect, token).await;
    assert_eq!(result.outcome, OrchestrationOutcome::Cancelled);
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_state_changes_are_broadcast() {
    let h = harness(RoutingMode::Off);
    let mut rx = h.orchestrator.subscribe();

    assert!(h.orchestrator.connect().await.success());

    assert_eq!(rx.recv().await.unwrap().state, ConnectionState::Starting);
    assert_eq!(rx.recv().await.unwrap().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_commands_complete_in_submission_order() {
    let h = harness(RoutingMode::Off);
    let connect = h
        .orchestrator
        .submit(OrchestratorCommand::Connect, CancellationToken::new());
    let disconnect = h
        .orchestrator
        .submit(OrchestratorCommand::Disconnect, CancellationToken::new());
    let reconnect = h
        .orchestrator
        .submit(OrchestratorCommand::Connect, CancellationToken::new());

    assert_eq!(connect.wait().await.message, "Connected.");
    assert_eq!(disconnect.wait().await.message, "Disconnected.");
    assert_eq!(reconnect.wait().await.message, "Connected.");
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_recover_proxy() {
    let h = harness(RoutingMode::Off);
    let result = h.orchestrator.recover_proxy().await;
    assert_eq!(result.message, "Proxy recovery completed.");
    assert_eq!(h.proxy.recoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_emergency_rollback_bypasses_queue() {
    let h = harness(RoutingMode::Off);
    h.orchestrator.shutdown().await;

    h.orchestrator.emergency_rollback().await;
    assert_eq!(h.proxy.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(h.pac.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_after_shutdown_fails() {
    let h = harness(RoutingMode::Off);
    h.orchestrator.shutdown().await;

    let result = h.orchestrator.connect().await;
    assert_eq!(result.message, "Orchestrator is shut down.");
}
