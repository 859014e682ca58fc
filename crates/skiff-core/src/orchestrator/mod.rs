//! Connection orchestrator.
//!
//! A single worker task drains an unbounded command queue in arrival order,
//! so process lifecycle, proxy configuration and PAC regeneration never run
//! concurrently.
//!
//! ## State machine
//!
//! ```text
//!                Connect                      ok
//!  Disconnected ─────────► Starting ───────────────► Connected
//!  / Faulted                  │ error                    │ Disconnect
//!      ▲                      ▼                          ▼
//!      │                   Faulted ◄──── errors ──── Stopping
//!      └──────────────────────────────── clean ──────────┘
//! ```
//!
//! `ApplyRouting`, `UpdatePac` and `UpdateLists` are coalesced: while one of
//! a kind is queued or running, another submission of that kind resolves
//! immediately as `NoOp`.

mod collaborators;
mod command;
mod state;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use collaborators::{
    Collaborators, ExecutableProvisioner, LaunchInfo, LaunchRequest, PacEngine, PacUpdate,
    ProcessExit, ProcessSupervisor, ResolvedPorts, SecretStore, SettingsMutation,
    SettingsProvider, SystemProxy,
};
pub use command::{CommandKind, OrchestratorCommand, PendingCommand};
pub use state::{ConnectionSnapshot, ConnectionState, OrchestrationOutcome, OrchestrationResult};

use crate::error::{CoreError, Result};
use crate::models::{AppSettings, RoutingMode};
use crate::ports::resolve_port;
use command::CommandEnvelope;

const STATE_CHANNEL_SIZE: usize = 64;

/// Extra time allowed past the graceful stop window for a forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Timeouts and paths used by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Bound on provisioning, process start, port wait and PAC resolution.
    pub start_timeout: Duration,
    /// Bound on each teardown step.
    pub stop_timeout: Duration,
    /// Bound on proxy session and routing changes.
    pub proxy_apply_timeout: Duration,
    /// How long `shutdown` waits for the worker.
    pub queue_shutdown_timeout: Duration,
    /// Where engine config files are written.
    pub runtime_dir: PathBuf,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            proxy_apply_timeout: Duration::from_secs(10),
            queue_shutdown_timeout: Duration::from_secs(10),
            runtime_dir: std::env::temp_dir().join("skiff").join("runtime"),
        }
    }
}

impl OrchestratorOptions {
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_proxy_apply_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_apply_timeout = timeout;
        self
    }
}

struct QueueState {
    tx: Option<mpsc::UnboundedSender<CommandEnvelope>>,
    /// Coalesced kinds currently queued or running.
    in_flight: HashSet<CommandKind>,
}

struct OrchestratorInner {
    deps: Collaborators,
    options: OrchestratorOptions,
    queue: Mutex<QueueState>,
    snapshot: ArcSwap<ConnectionSnapshot>,
    state_tx: broadcast::Sender<ConnectionSnapshot>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestratorInner {
    fn publish(&self, snapshot: ConnectionSnapshot) {
        info!(
            state = %snapshot.state,
            message = %snapshot.message,
            "Connection state changed"
        );
        self.snapshot.store(Arc::new(snapshot.clone()));
        let _ = self.state_tx.send(snapshot);
    }

    fn release(&self, kind: CommandKind) {
        if kind.is_coalesced() {
            self.queue.lock().in_flight.remove(&kind);
        }
    }
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Creates the orchestrator and spawns its worker and exit listener.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(deps: Collaborators, options: OrchestratorOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_SIZE);
        let exits = deps.supervisor.subscribe_exits();

        let orchestrator = Self {
            inner: Arc::new(OrchestratorInner {
                deps,
                options,
                queue: Mutex::new(QueueState {
                    tx: Some(tx),
                    in_flight: HashSet::new(),
                }),
                snapshot: ArcSwap::from_pointee(ConnectionSnapshot::initial()),
                state_tx,
                cancel: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
            }),
        };

        let worker = Worker::new(Arc::clone(&orchestrator.inner));
        let cancel = orchestrator.inner.cancel.clone();
        let mut handles = orchestrator.inner.handles.lock();
        handles.push(tokio::spawn(command_processor_task(worker, rx, cancel.clone())));
        handles.push(tokio::spawn(exit_listener_task(
            orchestrator.clone(),
            exits,
            cancel,
        )));
        drop(handles);

        orchestrator
    }

    /// Latest snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionSnapshot> {
        self.inner.state_tx.subscribe()
    }

    /// Enqueues a command without waiting for it.
    ///
    /// A coalesced duplicate is resolved immediately as `NoOp`.
    pub fn submit(&self, command: OrchestratorCommand, cancel: CancellationToken) -> PendingCommand {
        let kind = command.kind();
        let (response_tx, response_rx) = oneshot::channel();

        let mut queue = self.inner.queue.lock();
        let Some(tx) = queue.tx.clone() else {
            return PendingCommand::ready(OrchestrationResult::failed("Orchestrator is shut down."));
        };

        if kind.is_coalesced() && !queue.in_flight.insert(kind) {
            debug!(command = %kind, "Coalesced duplicate command");
            return PendingCommand::ready(OrchestrationResult::no_op(format!(
                "{kind} is already queued."
            )));
        }

        let envelope = CommandEnvelope {
            command,
            cancel: cancel.clone(),
            response_tx,
        };
        if tx.send(envelope).is_err() {
            queue.in_flight.remove(&kind);
            return PendingCommand::ready(OrchestrationResult::failed("Cannot enqueue command."));
        }

        PendingCommand::waiting(response_rx, cancel)
    }

    /// Enqueues a command and waits for its result.
    pub async fn execute(
        &self,
        command: OrchestratorCommand,
        cancel: CancellationToken,
    ) -> OrchestrationResult {
        self.submit(command, cancel).wait().await
    }

    pub async fn connect(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::Connect, CancellationToken::new()).await
    }

    pub async fn disconnect(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::Disconnect, CancellationToken::new()).await
    }

    pub async fn toggle(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::Toggle, CancellationToken::new()).await
    }

    pub async fn apply_routing(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::ApplyRouting, CancellationToken::new()).await
    }

    pub async fn update_pac(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::UpdatePac, CancellationToken::new()).await
    }

    pub async fn update_lists(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::UpdateLists, CancellationToken::new()).await
    }

    pub async fn recover_proxy(&self) -> OrchestrationResult {
        self.execute(OrchestratorCommand::RecoverProxy, CancellationToken::new()).await
    }

    /// Rolls back the OS proxy and stops the PAC server without going
    /// through the queue. Safe to call while the worker is stuck.
    pub async fn emergency_rollback(&self) {
        let deps = &self.inner.deps;
        let limit = self.inner.options.stop_timeout;

        match tokio::time::timeout(limit, deps.proxy.rollback()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Emergency rollback failed"),
            Err(_) => error!("Emergency rollback timed out"),
        }
        match tokio::time::timeout(limit, deps.pac.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "PAC shutdown failed during emergency rollback"),
            Err(_) => error!("PAC shutdown timed out during emergency rollback"),
        }
    }

    /// Stops accepting commands and waits for the worker to finish.
    ///
    /// Commands still queued resolve as failed.
    pub async fn shutdown(&self) {
        self.inner.queue.lock().tx = None;
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        let limit = self.inner.options.queue_shutdown_timeout;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(limit, handle).await.is_err() {
                warn!("Orchestrator task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────

/// Owns the connected-session fields. Only the worker task touches them.
struct Worker {
    inner: Arc<OrchestratorInner>,
    server_id: Option<String>,
    pac_profile_id: Option<String>,
    ports: Option<ResolvedPorts>,
}

impl Worker {
    fn new(inner: Arc<OrchestratorInner>) -> Self {
        Self {
            inner,
            server_id: None,
            pac_profile_id: None,
            ports: None,
        }
    }

    fn deps(&self) -> &Collaborators {
        &self.inner.deps
    }

    fn options(&self) -> &OrchestratorOptions {
        &self.inner.options
    }

    fn state(&self) -> ConnectionState {
        self.inner.snapshot.load().state
    }

    fn set_state(&self, state: ConnectionState, message: impl Into<String>) {
        let snapshot = ConnectionSnapshot::new(state, message).with_session(
            self.server_id.clone(),
            self.pac_profile_id.clone(),
            self.deps().supervisor.process_id(),
        );
        self.inner.publish(snapshot);
    }

    fn clear_session(&mut self) {
        self.server_id = None;
        self.pac_profile_id = None;
        self.ports = None;
    }

    async fn execute(
        &mut self,
        command: OrchestratorCommand,
        cancel: &CancellationToken,
    ) -> OrchestrationResult {
        let result = match command {
            OrchestratorCommand::Connect => Ok(self.connect(cancel).await),
            OrchestratorCommand::Disconnect => Ok(self.disconnect().await),
            OrchestratorCommand::Toggle => {
                if self.state().is_active() {
                    Ok(self.disconnect().await)
                } else {
                    Ok(self.connect(cancel).await)
                }
            }
            OrchestratorCommand::ApplyRouting => self.apply_routing(cancel).await,
            OrchestratorCommand::UpdatePac | OrchestratorCommand::UpdateLists => {
                self.update_pac(cancel).await
            }
            OrchestratorCommand::RecoverProxy => self.recover_proxy(cancel).await,
            OrchestratorCommand::FaultFromProcessExit(reason) => Ok(self.process_fault(reason).await),
        };

        result.unwrap_or_else(|e| {
            if e.is_cancelled() {
                OrchestrationResult::cancelled("Command was canceled.")
            } else {
                error!(error = %e, "Command failed");
                OrchestrationResult::failed(e.to_string())
            }
        })
    }

    async fn load_settings(&self, cancel: &CancellationToken) -> Result<AppSettings> {
        bounded(
            cancel,
            self.options().proxy_apply_timeout,
            "Loading settings",
            self.deps().settings.load(),
        )
        .await
    }

    // ── Connect ──────────────────────────────────────────────────────

    async fn connect(&mut self, cancel: &CancellationToken) -> OrchestrationResult {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Starting => {
                return OrchestrationResult::no_op("Already connected or connecting.");
            }
            ConnectionState::Stopping => {
                return OrchestrationResult::failed("Cannot connect while disconnecting.");
            }
            ConnectionState::Disconnected | ConnectionState::Faulted => {}
        }

        self.clear_session();
        self.set_state(ConnectionState::Starting, "Starting sslocal...");

        match self.try_connect(cancel).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected, "Connected");
                OrchestrationResult::ok("Connected.")
            }
            Err(e) if e.is_cancelled() => {
                warn!("Connect canceled, rolling back");
                self.fail_start("Connection was canceled.").await;
                OrchestrationResult::cancelled("Connect canceled.")
            }
            Err(e) => {
                error!(error = %e, "Connection failed");
                self.fail_start(&format!("Connection failed: {e}")).await;
                OrchestrationResult::failed(e.to_string())
            }
        }
    }

    async fn try_connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let start_timeout = self.options().start_timeout;
        let proxy_timeout = self.options().proxy_apply_timeout;

        let settings = self.load_settings(cancel).await?;
        let errors = self.deps().validator.validate(&settings);
        if !errors.is_empty() {
            return Err(CoreError::Validation(errors.join("\n")));
        }

        let profile = settings
            .active_server_profile()
            .cloned()
            .ok_or_else(|| CoreError::Validation("Active server profile is not configured.".into()))?;

        let password = self
            .deps()
            .secrets
            .read(&profile.password_secret_id)
            .await?
            .filter(|s| !s.expose_secret().trim().is_empty())
            .ok_or_else(|| {
                CoreError::Resource("Server password is missing in secure storage.".into())
            })?;

        let ports = self.resolve_ports(&settings)?;

        let configured = settings.sslocal_executable_path.as_deref().map(Path::new);
        let executable = bounded(
            cancel,
            start_timeout,
            "Provisioning sslocal",
            self.deps().provisioner.ensure_available(configured),
        )
        .await?;

        let request = LaunchRequest {
            executable,
            profile: profile.clone(),
            password,
            ports,
            listen_address: settings.ports.listen_address.clone(),
            work_dir: self.options().runtime_dir.clone(),
        };
        let launch = bounded(
            cancel,
            start_timeout,
            "Starting sslocal",
            self.deps().supervisor.start(request),
        )
        .await?;
        info!(pid = ?launch.pid, config = %launch.config_path.display(), "sslocal started");

        let healthy = bounded(
            cancel,
            start_timeout + Duration::from_secs(1),
            "Waiting for sslocal",
            async { Ok(self.deps().supervisor.wait_for_port(ports.socks, start_timeout).await) },
        )
        .await?;
        if !healthy {
            return Err(CoreError::Timeout(format!(
                "sslocal did not open localhost:{} in time.",
                ports.socks
            )));
        }

        self.server_id = Some(profile.id.clone());
        self.ports = Some(ports);

        let mode = settings.routing_mode;
        if mode != RoutingMode::Off {
            bounded(
                cancel,
                proxy_timeout,
                "Beginning proxy session",
                self.deps().proxy.begin_session(),
            )
            .await?;

            let mut pac_uri = None;
            if mode == RoutingMode::Pac {
                let pac_profile = settings.active_pac_profile().cloned().ok_or_else(|| {
                    CoreError::Validation("Active PAC profile is not configured.".into())
                })?;
                let uri = bounded(
                    cancel,
                    start_timeout,
                    "Resolving PAC",
                    self.deps().pac.resolve_uri(&pac_profile, ports.socks, ports.pac),
                )
                .await?;
                self.pac_profile_id = Some(pac_profile.id);
                pac_uri = Some(uri);
            }

            bounded(
                cancel,
                proxy_timeout,
                "Applying routing",
                self.deps()
                    .proxy
                    .apply_routing_mode(mode, &ports, pac_uri.as_deref()),
            )
            .await?;
        }

        info!(
            server = %profile.name,
            socks = ports.socks,
            http = ?ports.http,
            pac = ports.pac,
            mode = %mode,
            "Tunnel connected"
        );
        Ok(())
    }

    fn resolve_ports(&self, settings: &AppSettings) -> Result<ResolvedPorts> {
        let allocator = self.deps().ports.as_ref();
        let auto = settings.ports.auto_select_on_conflict;

        let socks = resolve_port(allocator, settings.ports.socks_port, auto)?;
        let http = settings
            .ports
            .http_port
            .filter(|p| *p > 0)
            .map(|p| resolve_port(allocator, p, auto))
            .transpose()?;
        let pac = resolve_port(allocator, settings.ports.pac_port, auto)?;

        Ok(ResolvedPorts { socks, http, pac })
    }

    async fn fail_start(&mut self, message: &str) {
        let stop_timeout = self.options().stop_timeout;
        let deps = self.deps().clone();

        cleanup_step("Proxy rollback after failed start", stop_timeout, deps.proxy.rollback()).await;
        cleanup_step("PAC stop after failed start", stop_timeout, deps.pac.stop()).await;
        cleanup_step(
            "sslocal stop after failed start",
            stop_timeout + KILL_GRACE,
            deps.supervisor.stop(stop_timeout),
        )
        .await;

        self.clear_session();
        self.set_state(ConnectionState::Faulted, message);
    }

    // ── Disconnect ───────────────────────────────────────────────────

    /// Teardown runs to completion regardless of the caller's token.
    async fn disconnect(&mut self) -> OrchestrationResult {
        if self.state() == ConnectionState::Disconnected {
            return OrchestrationResult::no_op("Already disconnected.");
        }

        self.set_state(ConnectionState::Stopping, "Disconnecting...");

        let stop_timeout = self.options().stop_timeout;
        let deps = self.deps().clone();
        let mut failures = 0usize;

        if !cleanup_step("Proxy rollback during disconnect", stop_timeout, deps.proxy.rollback()).await {
            failures += 1;
        }
        if !cleanup_step("PAC stop during disconnect", stop_timeout, deps.pac.stop()).await {
            failures += 1;
        }
        if !cleanup_step(
            "sslocal stop during disconnect",
            stop_timeout + KILL_GRACE,
            deps.supervisor.stop(stop_timeout),
        )
        .await
        {
            failures += 1;
        }

        self.clear_session();

        if failures > 0 {
            self.set_state(ConnectionState::Faulted, "Disconnected with errors.");
            return OrchestrationResult::failed(format!(
                "Disconnect completed with {failures} errors."
            ));
        }

        self.set_state(ConnectionState::Disconnected, "Disconnected");
        OrchestrationResult::ok("Disconnected.")
    }

    // ── Routing and PAC ──────────────────────────────────────────────

    async fn apply_routing(&mut self, cancel: &CancellationToken) -> Result<OrchestrationResult> {
        let settings = self.load_settings(cancel).await?;
        if self.state() != ConnectionState::Connected {
            return Ok(OrchestrationResult::no_op(
                "Routing update saved, current state is not Connected.",
            ));
        }

        let ports = self
            .ports
            .ok_or_else(|| CoreError::Resource("Connected session has no ports.".into()))?;
        let proxy_timeout = self.options().proxy_apply_timeout;
        let mode = settings.routing_mode;

        let mut pac_uri = None;
        if mode == RoutingMode::Pac {
            let pac_profile = settings.active_pac_profile().cloned().ok_or_else(|| {
                CoreError::Validation("Active PAC profile is not configured.".into())
            })?;
            let uri = bounded(
                cancel,
                proxy_timeout,
                "Resolving PAC",
                self.deps().pac.resolve_uri(&pac_profile, ports.socks, ports.pac),
            )
            .await?;
            self.pac_profile_id = Some(pac_profile.id);
            pac_uri = Some(uri);
        }

        if mode != RoutingMode::Off {
            bounded(
                cancel,
                proxy_timeout,
                "Beginning proxy session",
                self.deps().proxy.begin_session(),
            )
            .await?;
        }

        bounded(
            cancel,
            proxy_timeout,
            "Applying routing",
            self.deps()
                .proxy
                .apply_routing_mode(mode, &ports, pac_uri.as_deref()),
        )
        .await?;

        self.set_state(ConnectionState::Connected, format!("Routing mode applied: {mode}"));
        Ok(OrchestrationResult::ok("Routing mode applied."))
    }

    async fn update_pac(&mut self, cancel: &CancellationToken) -> Result<OrchestrationResult> {
        let settings = self.load_settings(cancel).await?;
        let Some(profile) = settings.active_pac_profile().cloned() else {
            return Ok(OrchestrationResult::no_op("No active PAC profile."));
        };

        let socks_port = self.ports.map(|p| p.socks).unwrap_or(settings.ports.socks_port);
        let update = bounded(
            cancel,
            self.options().start_timeout,
            "Updating PAC",
            async { Ok(self.deps().pac.update_managed(&profile, socks_port).await) },
        )
        .await?;

        if update.applied {
            info!(profile = %profile.name, rules = update.rule_count, "Managed PAC regenerated");
        } else {
            warn!(profile = %profile.name, message = %update.message, "PAC update kept last-good script");
        }

        if self.state() == ConnectionState::Connected && settings.routing_mode == RoutingMode::Pac {
            let chained = self.apply_routing(cancel).await?;
            if !chained.success() {
                return Ok(chained);
            }
        }

        Ok(if update.applied {
            OrchestrationResult::ok(update.message)
        } else {
            OrchestrationResult::failed(update.message)
        })
    }

    async fn recover_proxy(&mut self, cancel: &CancellationToken) -> Result<OrchestrationResult> {
        let recovered = bounded(
            cancel,
            self.options().proxy_apply_timeout,
            "Proxy recovery",
            self.deps().proxy.crash_recover_if_needed(),
        )
        .await?;
        if recovered {
            info!("Restored proxy settings left by a previous run");
        }
        Ok(OrchestrationResult::ok("Proxy recovery completed."))
    }

    // ── Faults ───────────────────────────────────────────────────────

    async fn process_fault(&mut self, reason: String) -> OrchestrationResult {
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Stopping
        ) {
            return OrchestrationResult::no_op(
                "Runner fault ignored because tunnel is stopping/disconnected.",
            );
        }

        self.clear_session();
        self.set_state(ConnectionState::Faulted, reason.clone());

        let stop_timeout = self.options().stop_timeout;
        let deps = self.deps().clone();
        cleanup_step("Proxy rollback after unexpected exit", stop_timeout, deps.proxy.rollback()).await;
        cleanup_step("PAC stop after unexpected exit", stop_timeout, deps.pac.stop()).await;

        OrchestrationResult::failed(reason)
    }
}

/// Bounds `fut` by `limit` and by the caller's token.
async fn bounded<T, F>(cancel: &CancellationToken, limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        result = tokio::time::timeout(limit, fut) => result.unwrap_or_else(|_| {
            Err(CoreError::Timeout(format!(
                "{what} timed out after {} ms.",
                limit.as_millis()
            )))
        }),
    }
}

/// Runs one best-effort teardown step. Returns false on failure.
async fn cleanup_step<F>(what: &str, limit: Duration, fut: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "{what} failed");
            false
        }
        Err(_) => {
            error!("{what} timed out");
            false
        }
    }
}

async fn command_processor_task(
    mut worker: Worker,
    mut rx: mpsc::UnboundedReceiver<CommandEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let kind = envelope.command.kind();
                debug!(command = %kind, "Executing command");

                let result = if envelope.cancel.is_cancelled() {
                    OrchestrationResult::cancelled("Command was canceled.")
                } else {
                    worker.execute(envelope.command, &envelope.cancel).await
                };

                worker.inner.release(kind);
                debug!(command = %kind, outcome = ?result.outcome, "Command finished");
                let _ = envelope.response_tx.send(result);
            }
        }
    }
    debug!("Command processor stopped");
}

async fn exit_listener_task(
    orchestrator: Orchestrator,
    mut exits: broadcast::Receiver<ProcessExit>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            exit = exits.recv() => match exit {
                Ok(exit) => {
                    error!(code = ?exit.exit_code, reason = %exit.reason, "sslocal exited unexpectedly");
                    drop(orchestrator.submit(
                        OrchestratorCommand::FaultFromProcessExit(exit.reason),
                        CancellationToken::new(),
                    ));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Exit listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests;
