//! Orchestrator commands and their completion handles.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::state::OrchestrationResult;

/// Command tag, used for logging and coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect,
    Disconnect,
    Toggle,
    ApplyRouting,
    UpdatePac,
    UpdateLists,
    RecoverProxy,
    FaultFromProcessExit,
}

impl CommandKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Toggle => "Toggle",
            Self::ApplyRouting => "ApplyRouting",
            Self::UpdatePac => "UpdatePac",
            Self::UpdateLists => "UpdateLists",
            Self::RecoverProxy => "RecoverProxy",
            Self::FaultFromProcessExit => "FaultFromProcessExit",
        }
    }

    /// At most one command of a coalesced kind is queued or running.
    pub fn is_coalesced(&self) -> bool {
        matches!(self, Self::ApplyRouting | Self::UpdatePac | Self::UpdateLists)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command for the orchestrator worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    Connect,
    Disconnect,
    Toggle,
    ApplyRouting,
    UpdatePac,
    UpdateLists,
    RecoverProxy,
    /// The proxy engine exited outside a stop sequence.
    FaultFromProcessExit(String),
}

impl OrchestratorCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Connect => CommandKind::Connect,
            Self::Disconnect => CommandKind::Disconnect,
            Self::Toggle => CommandKind::Toggle,
            Self::ApplyRouting => CommandKind::ApplyRouting,
            Self::UpdatePac => CommandKind::UpdatePac,
            Self::UpdateLists => CommandKind::UpdateLists,
            Self::RecoverProxy => CommandKind::RecoverProxy,
            Self::FaultFromProcessExit(_) => CommandKind::FaultFromProcessExit,
        }
    }
}

/// Queued command plus its reply channel.
pub(crate) struct CommandEnvelope {
    pub command: OrchestratorCommand,
    pub cancel: CancellationToken,
    pub response_tx: oneshot::Sender<OrchestrationResult>,
}

/// Completion handle returned by `Orchestrator::submit`.
///
/// Dropping it is fine: the command still runs, its result is discarded.
pub struct PendingCommand {
    state: PendingState,
}

enum PendingState {
    Ready(OrchestrationResult),
    Waiting {
        response_rx: oneshot::Receiver<OrchestrationResult>,
        cancel: CancellationToken,
    },
}

impl PendingCommand {
    pub(crate) fn ready(result: OrchestrationResult) -> Self {
        Self {
            state: PendingState::Ready(result),
        }
    }

    pub(crate) fn waiting(
        response_rx: oneshot::Receiver<OrchestrationResult>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: PendingState::Waiting {
                response_rx,
                cancel,
            },
        }
    }

    /// Returns true if the result was decided at submission time.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }

    /// Waits for the worker's result, or for the caller's token.
    pub async fn wait(self) -> OrchestrationResult {
        match self.state {
            PendingState::Ready(result) => result,
            PendingState::Waiting {
                response_rx,
                cancel,
            } => {
                tokio::select! {
                    biased;
                    result = response_rx => result.unwrap_or_else(|_| {
                        OrchestrationResult::failed("Orchestrator stopped before completing the command.")
                    }),
                    () = cancel.cancelled() => OrchestrationResult::cancelled("Command was canceled."),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::OrchestrationOutcome;

    #[test]
    fn test_coalesced_kinds() {
        assert!(CommandKind::ApplyRouting.is_coalesced());
        assert!(CommandKind::UpdatePac.is_coalesced());
        assert!(CommandKind::UpdateLists.is_coalesced());
        assert!(!CommandKind::Connect.is_coalesced());
        assert!(!OrchestratorCommand::FaultFromProcessExit("x".into()).kind().is_coalesced());
    }

    #[tokio::test]
    async fn test_pending_ready_and_dropped_sender() {
        let ready = PendingCommand::ready(OrchestrationResult::no_op("dup"));
        assert!(ready.is_ready());
        assert!(ready.wait().await.is_no_op());

        let (tx, rx) = oneshot::channel();
        drop(tx);
        let result = PendingCommand::waiting(rx, CancellationToken::new()).wait().await;
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_pending_honours_caller_token() {
        let (_tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        token.cancel();
        let result = PendingCommand::waiting(rx, token).wait().await;
        assert_eq!(result.outcome, OrchestrationOutcome::Cancelled);
    }
}
