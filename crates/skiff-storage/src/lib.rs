//! Skiff storage.
//!
//! Filesystem persistence for the pieces the orchestrator treats as
//! collaborators:
//!
//! - Application directory layout ([`AppPaths`])
//! - Atomic write-then-rename ([`write_atomic`])
//! - JSON settings document ([`JsonSettingsStore`])
//! - Per-id secret files ([`FileSecretStore`])

pub mod atomic;
pub mod error;
pub mod paths;
pub mod secret_store;
pub mod settings_store;

pub use atomic::write_atomic;
pub use error::{Result, StorageError};
pub use paths::AppPaths;
pub use secret_store::FileSecretStore;
pub use settings_store::JsonSettingsStore;
