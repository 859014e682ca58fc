//! Connection state, snapshots, and command results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tunnel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Starting,
    Connected,
    Stopping,
    Faulted,
}

impl ConnectionState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
            Self::Faulted => "faulted",
        }
    }

    /// Connected or on the way there.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::Starting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable view of the tunnel, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub active_server_id: Option<String>,
    pub active_pac_profile_id: Option<String>,
    pub process_id: Option<u32>,
}

impl ConnectionSnapshot {
    /// Snapshot for a freshly constructed orchestrator.
    pub fn initial() -> Self {
        Self::new(ConnectionState::Disconnected, "")
    }

    pub fn new(state: ConnectionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            updated_at: Utc::now(),
            active_server_id: None,
            active_pac_profile_id: None,
            process_id: None,
        }
    }

    /// Attaches session identifiers.
    pub fn with_session(
        mut self,
        server_id: Option<String>,
        pac_profile_id: Option<String>,
        process_id: Option<u32>,
    ) -> Self {
        self.active_server_id = server_id;
        self.active_pac_profile_id = pac_profile_id;
        self.process_id = process_id;
        self
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    Ok,
    NoOp,
    Failed,
    Cancelled,
}

/// Result of one orchestrator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub outcome: OrchestrationOutcome,
    pub message: String,
}

impl OrchestrationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with(OrchestrationOutcome::Ok, message)
    }

    pub fn no_op(message: impl Into<String>) -> Self {
        Self::with(OrchestrationOutcome::NoOp, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with(OrchestrationOutcome::Failed, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::with(OrchestrationOutcome::Cancelled, message)
    }

    fn with(outcome: OrchestrationOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    /// True for `Ok` and `NoOp`.
    pub fn success(&self) -> bool {
        matches!(self.outcome, OrchestrationOutcome::Ok | OrchestrationOutcome::NoOp)
    }

    pub fn is_no_op(&self) -> bool {
        self.outcome == OrchestrationOutcome::NoOp
    }
}

impl std::fmt::Display for OrchestrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.outcome, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_covers_ok_and_no_op() {
        assert!(OrchestrationResult::ok("x").success());
        assert!(OrchestrationResult::no_op("x").success());
        assert!(!OrchestrationResult::failed("x").success());
        assert!(!OrchestrationResult::cancelled("x").success());
    }

    #[test]
    fn test_initial_snapshot() {
        let snapshot = ConnectionSnapshot::initial();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.process_id.is_none());
        assert!(!snapshot.state.is_active());
        assert!(ConnectionState::Starting.is_active());
    }
}
