//! The `sslocal` proxy engine: config file, process supervision and
//! executable provisioning.

pub mod config;
pub mod provisioner;
pub mod runner;

pub use config::{build_config_json, server_url};
pub use provisioner::SsLocalProvisioner;
pub use runner::{redact, SsLocalSupervisor};
