//! Skiff Proxy - OS-facing collaborators of the connection orchestrator.
//!
//! ## Features
//!
//! - Supervises the `sslocal` process and redacts its output
//! - Locates or downloads the `sslocal` executable
//! - Applies OS proxy settings inside a snapshot/rollback session
//! - Restores settings left behind by a crash
//! - Regenerates and serves the managed PAC script
//! - Fetches remote resources over HTTPS with an on-disk cache
//!
//! ## Architecture
//!
//! ```text
//!                       Orchestrator (skiff-core)
//!                                  │
//!        ┌──────────────┬──────────┴───────┬────────────────────┐
//!        ▼              ▼                  ▼                    ▼
//!  SsLocalSupervisor  SsLocalProvisioner  SystemProxyManager   PacManager
//!        │              │                  │                    │
//!   child process    GitHub release    ProxySettingsBackend   HttpCache ─► PacServer
//!                                      (registry, gsettings,
//!                                       networksetup, memory)
//! ```

pub mod error;
pub mod http_cache;
pub mod pac_manager;
pub mod presets;
pub mod sslocal;
pub mod system_proxy;

pub use error::{ProxyError, Result};
pub use http_cache::{HttpCache, HttpCacheResult};
pub use pac_manager::PacManager;
pub use presets::PresetCatalog;
pub use sslocal::{build_config_json, redact, SsLocalProvisioner, SsLocalSupervisor};
pub use system_proxy::{
    platform_backend, settings_for_mode, InMemoryBackend, ProxySettings, ProxySettingsBackend,
    ProxySnapshot, SystemProxyManager,
};
