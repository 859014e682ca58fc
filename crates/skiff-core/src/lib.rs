//! Skiff core library.
//!
//! Domain models, settings validation, the PAC rule engine, port allocation
//! and the connection orchestrator. Everything that touches the OS, the
//! network or the disk sits behind the traits in [`orchestrator`] and is
//! implemented by the other workspace crates.

pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pac;
pub mod ports;
pub mod ss_uri;
pub mod validation;

pub use error::{CoreError, Result};
pub use models::{
    new_id, AppSettings, HotkeyGesture, LocalPortSettings, PacDefaultAction, PacPreset,
    PacProfile, PacProfileKind, RoutingMode, ServerProfile, CURRENT_SCHEMA_VERSION,
};
pub use orchestrator::{
    Collaborators, ConnectionSnapshot, ConnectionState, OrchestrationOutcome, OrchestrationResult,
    Orchestrator, OrchestratorCommand, OrchestratorOptions, ResolvedPorts,
};
pub use pac::{evaluate, generate_script, LastGoodPac, PacAction, PacEvaluation, PacRuleSet};
pub use ports::{PortAllocator, TcpPortProbe};
pub use ss_uri::{export_ss_uri, parse_ss_uri};
pub use validation::{SettingsValidator, StandardValidator};
