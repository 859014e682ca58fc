//! `sslocal` process supervision.
//!
//! The supervisor is the only owner of the child process. A watcher task
//! holds the [`Child`] and reports its exit; everyone else sees the pid.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use skiff_core::orchestrator::{LaunchInfo, LaunchRequest, ProcessExit, ProcessSupervisor};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::build_config_json;
use crate::error::{ProxyError, Result};

/// Per-attempt connect timeout while waiting for the local port.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Delay between port probes.
pub const PORT_PROBE_DELAY: Duration = Duration::from_millis(120);

const KILL_WAIT: Duration = Duration::from_secs(5);

static PASSWORD_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)"password"\s*:\s*"[^"]+""#).ok());
static SS_URI: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)ss://\S+").ok());

/// Masks passwords and `ss://` payloads in a log line.
pub fn redact(line: &str) -> String {
    let mut out = line.to_string();
    if let Some(re) = PASSWORD_JSON.as_ref() {
        out = re.replace_all(&out, r#""password":"***""#).into_owned();
    }
    if let Some(re) = SS_URI.as_ref() {
        out = re.replace_all(&out, "ss://***").into_owned();
    }
    out
}

struct RunningProcess {
    pid: Option<u32>,
    config_path: PathBuf,
    stopping: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Starts, watches and stops `sslocal`.
pub struct SsLocalSupervisor {
    running: Mutex<Option<RunningProcess>>,
    pid: Arc<AtomicU32>,
    exits: broadcast::Sender<ProcessExit>,
}

impl Default for SsLocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SsLocalSupervisor {
    pub fn new() -> Self {
        let (exits, _) = broadcast::channel(16);
        Self {
            running: Mutex::new(None),
            pid: Arc::new(AtomicU32::new(0)),
            exits,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.watcher.is_finished())
    }

    pub async fn start_process(&self, request: LaunchRequest) -> Result<LaunchInfo> {
        let mut running = self.running.lock().await;

        if let Some(previous) = running.as_ref() {
            if !previous.watcher.is_finished() {
                return Err(ProxyError::Process("sslocal is already running.".into()));
            }
        }
        if let Some(stale) = running.take() {
            remove_config(&stale.config_path).await;
        }

        if !request.executable.is_file() {
            return Err(ProxyError::Process(format!(
                "sslocal executable not found: {}",
                request.executable.display()
            )));
        }

        let config_path = request.work_dir.join(format!(
            "sslocal.{}.{}.json",
            request.profile.id,
            Utc::now().timestamp()
        ));
        let config = build_config_json(
            &request.profile,
            &request.password,
            &request.ports,
            &request.listen_address,
        )?;
        skiff_storage::write_atomic(&config_path, config.as_bytes()).await?;
        restrict_permissions(&config_path).await;

        let mut child = match Command::new(&request.executable)
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                remove_config(&config_path).await;
                return Err(ProxyError::Process(format!("Failed to launch sslocal: {e}")));
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        let watcher = tokio::spawn(watch_process(
            child,
            kill_rx,
            Arc::clone(&stopping),
            Arc::clone(&self.pid),
            self.exits.clone(),
        ));

        let started_at = Utc::now();
        info!(pid = ?pid, config = %config_path.display(), "sslocal started");
        *running = Some(RunningProcess {
            pid,
            config_path: config_path.clone(),
            stopping,
            kill_tx: Some(kill_tx),
            watcher,
        });

        Ok(LaunchInfo {
            pid,
            started_at,
            config_path,
        })
    }

    /// Asks the process to exit, kills it after `graceful`.
    pub async fn stop_process(&self, graceful: Duration) -> Result<()> {
        let Some(mut process) = self.running.lock().await.take() else {
            return Ok(());
        };
        process.stopping.store(true, Ordering::SeqCst);

        if !process.watcher.is_finished() {
            if let Some(pid) = process.pid {
                request_termination(pid).await;
            }
            if tokio::time::timeout(graceful, &mut process.watcher).await.is_err() {
                warn!(pid = ?process.pid, "sslocal graceful stop timed out, killing");
                if let Some(kill_tx) = process.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                if tokio::time::timeout(KILL_WAIT, &mut process.watcher).await.is_err() {
                    process.watcher.abort();
                    self.pid.store(0, Ordering::SeqCst);
                    remove_config(&process.config_path).await;
                    return Err(ProxyError::Process("sslocal did not exit after kill.".into()));
                }
            }
        }

        self.pid.store(0, Ordering::SeqCst);
        remove_config(&process.config_path).await;
        info!("sslocal stopped");
        Ok(())
    }

    /// Polls `127.0.0.1:<port>` until it accepts a connection.
    pub async fn wait_for_local_port(port: u16, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let attempt =
                tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
                    .await;
            if matches!(attempt, Ok(Ok(_))) {
                return true;
            }
            tokio::time::sleep(PORT_PROBE_DELAY).await;
        }
        false
    }
}

async fn watch_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stopping: Arc<AtomicBool>,
    pid: Arc<AtomicU32>,
    exits: broadcast::Sender<ProcessExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill sslocal");
            }
            child.wait().await
        }
    };
    pid.store(0, Ordering::SeqCst);

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    if stopping.load(Ordering::SeqCst) {
        return;
    }

    let reason = match exit_code {
        Some(code) => format!("sslocal exited unexpectedly (code {code})."),
        None => "sslocal exited unexpectedly.".to_string(),
    };
    warn!(exit_code = ?exit_code, "sslocal exited while no stop was requested");
    let _ = exits.send(ProcessExit { exit_code, reason });
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let line = redact(&line);
        if is_stderr {
            warn!(process = "sslocal", "{line}");
        } else {
            info!(process = "sslocal", "{line}");
        }
    }
}

#[cfg(unix)]
async fn request_termination(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "sslocal pid out of range, cannot signal");
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(pid, error = %e, "Failed to signal sslocal");
    }
}

#[cfg(not(unix))]
async fn request_termination(_pid: u32) {
    // Console processes have no window to close; the graceful window just
    // lets an exiting process finish before it is killed.
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        warn!(path = %path.display(), error = %e, "Failed to restrict sslocal config permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

async fn remove_config(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete sslocal config"),
    }
}

#[async_trait]
impl ProcessSupervisor for SsLocalSupervisor {
    async fn start(&self, request: LaunchRequest) -> skiff_core::Result<LaunchInfo> {
        Ok(self.start_process(request).await?)
    }

    async fn stop(&self, graceful: Duration) -> skiff_core::Result<()> {
        Ok(self.stop_process(graceful).await?)
    }

    async fn wait_for_port(&self, port: u16, timeout: Duration) -> bool {
        Self::wait_for_local_port(port, timeout).await
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid.load(Ordering::SeqCst)).filter(|pid| *pid != 0)
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.exits.subscribe()
    }
}
