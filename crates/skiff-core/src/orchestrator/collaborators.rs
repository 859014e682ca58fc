//! Contracts the orchestrator drives.
//!
//! Concrete implementations live in `skiff-storage` (settings, secrets) and
//! `skiff-proxy` (process supervisor, system proxy, PAC, provisioning).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{AppSettings, PacProfile, RoutingMode, ServerProfile};
use crate::ports::PortAllocator;
use crate::validation::SettingsValidator;

/// Ports resolved for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPorts {
    pub socks: u16,
    /// `None` when no HTTP listener is configured.
    pub http: Option<u16>,
    pub pac: u16,
}

/// Read-modify-write closure for [`SettingsProvider::update`].
pub type SettingsMutation = Box<dyn FnOnce(&mut AppSettings) + Send>;

/// Persistent settings.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> Result<AppSettings>;

    /// Applies `mutate` to the stored settings and persists the result.
    async fn update(&self, mutate: SettingsMutation) -> Result<AppSettings>;
}

/// Secret storage keyed by id.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<SecretString>>;
    async fn save(&self, id: &str, secret: &SecretString) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Everything needed to launch the proxy engine.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    pub profile: ServerProfile,
    pub password: SecretString,
    pub ports: ResolvedPorts,
    pub listen_address: String,
    /// Directory for the generated engine config.
    pub work_dir: PathBuf,
}

/// A launched proxy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfo {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub config_path: PathBuf,
}

/// Published when the engine exits while no stop is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub reason: String,
}

/// Owns the proxy engine process. Callers only see its pid.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, request: LaunchRequest) -> Result<LaunchInfo>;

    /// Stops the engine, waiting up to `graceful` before killing it.
    async fn stop(&self, graceful: Duration) -> Result<()>;

    /// Polls until `127.0.0.1:<port>` accepts connections or `timeout` ends.
    async fn wait_for_port(&self, port: u16, timeout: Duration) -> bool;

    fn process_id(&self) -> Option<u32>;

    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit>;
}

/// Transactional OS proxy configuration.
#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// Restores a snapshot left behind by a crashed run. Returns true if one
    /// was restored.
    async fn crash_recover_if_needed(&self) -> Result<bool>;

    async fn begin_session(&self) -> Result<()>;

    async fn apply_routing_mode(
        &self,
        mode: RoutingMode,
        ports: &ResolvedPorts,
        pac_uri: Option<&str>,
    ) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Outcome of a managed PAC regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacUpdate {
    pub applied: bool,
    pub message: String,
    pub rule_count: usize,
}

impl PacUpdate {
    pub fn applied(rule_count: usize) -> Self {
        Self {
            applied: true,
            message: format!("Managed PAC updated with {rule_count} rules."),
            rule_count,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            message: message.into(),
            rule_count: 0,
        }
    }
}

/// PAC regeneration and resolution.
#[async_trait]
pub trait PacEngine: Send + Sync {
    /// Regenerates the managed script. Failures keep the last-good script
    /// and are reported through [`PacUpdate::applied`].
    async fn update_managed(&self, profile: &PacProfile, socks_port: u16) -> PacUpdate;

    /// Returns the URI the OS should load the PAC script from.
    async fn resolve_uri(&self, profile: &PacProfile, socks_port: u16, pac_port: u16)
        -> Result<String>;

    /// Stops serving the local script.
    async fn stop(&self) -> Result<()>;
}

/// Locates (or installs) the proxy engine executable.
#[async_trait]
pub trait ExecutableProvisioner: Send + Sync {
    async fn ensure_available(&self, configured: Option<&Path>) -> Result<PathBuf>;
}

/// The orchestrator's collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub settings: Arc<dyn SettingsProvider>,
    pub validator: Arc<dyn SettingsValidator>,
    pub secrets: Arc<dyn SecretStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub proxy: Arc<dyn SystemProxy>,
    pub pac: Arc<dyn PacEngine>,
    pub ports: Arc<dyn PortAllocator>,
    pub provisioner: Arc<dyn ExecutableProvisioner>,
}
