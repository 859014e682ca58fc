//! Skiff - Shadowsocks tunnel manager.
//!
//! This crate holds the pieces of the `skiff` binary that are worth testing
//! on their own:
//!
//! - Collaborator wiring around the orchestrator ([`context`])
//! - Diagnostics report and support bundle ([`diagnostics`])
//! - Shutdown signal handling ([`signals`])

pub mod context;
pub mod diagnostics;
pub mod signals;

pub use context::AppContext;
pub use diagnostics::{export_bundle, recent_log_lines, DiagnosticsError, DiagnosticsSnapshot};
pub use signals::shutdown_signal;
