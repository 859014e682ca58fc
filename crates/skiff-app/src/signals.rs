//! Process shutdown requests.
//!
//! | Platform | Signals |
//! |---|---|
//! | Unix | Ctrl-C, `SIGTERM`, `SIGHUP` |
//! | Windows | Ctrl-C, console close, logoff, system shutdown |

use anyhow::Context;

/// Waits for Ctrl-C or a request from the OS to end the process.
///
/// Handlers are installed on first poll; spawn this early so a signal that
/// arrives during startup is caught instead of ending the process.
pub async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                Ok("Ctrl-C")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
            _ = hangup.recv() => Ok("SIGHUP"),
        }
    }

    #[cfg(windows)]
    {
        use tokio::signal::windows;

        let mut close = windows::ctrl_close().context("Failed to listen for console close")?;
        let mut logoff = windows::ctrl_logoff().context("Failed to listen for logoff")?;
        let mut shutdown = windows::ctrl_shutdown().context("Failed to listen for shutdown")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                Ok("Ctrl-C")
            }
            _ = close.recv() => Ok("console close"),
            _ = logoff.recv() => Ok("logoff"),
            _ = shutdown.recv() => Ok("system shutdown"),
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use super::*;

    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let listener = tokio::spawn(shutdown_signal());
        tokio::time::sleep(Duration::from_millis(100)).await;

        kill(Pid::this(), Signal::SIGTERM).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, "SIGTERM");
    }
}
