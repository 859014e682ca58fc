//! Skiff PAC server.
//!
//! Serves the generated proxy auto-config script over loopback HTTP.
//!
//! ## Endpoint
//!
//! - `GET /proxy.pac` - current script (`application/x-ns-proxy-autoconfig`)
//!
//! Everything else is `404`. The script can be swapped while the listener
//! runs; [`PacServer::current_uri`] carries a `v=` counter so clients that
//! cache by URL pick up the new script.
//!
//! ## Example
//!
//! ```no_run
//! use skiff_server::PacServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = PacServer::new();
//!     server.start(8090).await.unwrap();
//!     server.update_script("function FindProxyForURL(u, h) { return 'DIRECT'; }");
//!     println!("{}", server.current_uri().await.unwrap());
//! }
//! ```

pub mod error;
mod handlers;
pub mod state;

use std::net::{Ipv4Addr, SocketAddr};

use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use error::{Result, ServerError};
pub use handlers::{PAC_CONTENT_TYPE, PAC_PATH};
pub use state::PacState;

/// Loopback address the server binds to.
pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Loopback PAC server with a hot-swappable script.
pub struct PacServer {
    state: PacState,
    running: Mutex<Option<Running>>,
}

impl Default for PacServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacServer {
    /// Creates a stopped server holding the fallback script.
    pub fn new() -> Self {
        Self::with_state(PacState::default())
    }

    /// Creates a stopped server with custom state.
    pub fn with_state(state: PacState) -> Self {
        Self {
            state,
            running: Mutex::new(None),
        }
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Starts listening on `127.0.0.1:<port>` and returns the bound port.
    ///
    /// Port 0 binds an ephemeral port. Starting on the port already in use
    /// is a no-op; a different port restarts the listener.
    pub async fn start(&self, port: u16) -> Result<u16> {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_ref() {
            if port == 0 || current.port == port {
                return Ok(current.port);
            }
        }
        if let Some(previous) = running.take() {
            info!(old = previous.port, new = port, "Restarting PAC server on new port");
            shutdown(previous).await;
        }

        let addr = SocketAddr::from((DEFAULT_HOST, port));
        let listener = bind(addr)?;
        let bound = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(addr, e))?
            .port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = self.router();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "PAC server stopped with error");
            }
        });

        info!(port = bound, "PAC server listening");
        *running = Some(Running {
            port: bound,
            shutdown: shutdown_tx,
            handle,
        });
        Ok(bound)
    }

    /// Stops the listener. No-op when stopped.
    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            info!(port = running.port, "Stopping PAC server");
            shutdown(running).await;
        }
    }

    /// Swaps the served script. Returns the new version.
    pub fn update_script(&self, script: impl Into<String>) -> u64 {
        self.state.replace(script)
    }

    /// Current script.
    pub fn script(&self) -> String {
        self.state.script().as_str().to_owned()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    /// `http://127.0.0.1:<port>/proxy.pac?v=<version>`, or `None` when stopped.
    pub async fn current_uri(&self) -> Option<String> {
        let port = self.port().await?;
        Some(format!(
            "http://{DEFAULT_HOST}:{port}{PAC_PATH}?v={}",
            self.state.version()
        ))
    }
}

fn build_router(state: PacState) -> Router {
    Router::new()
        .fallback(handlers::serve_pac)
        .with_state(state)
}

async fn shutdown(running: Running) {
    let _ = running.shutdown.send(());
    if let Err(e) = running.handle.await {
        warn!(error = %e, "PAC server task ended abnormally");
    }
}

fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    // SO_REUSEADDR lets a restart reuse a port still in TIME_WAIT.
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .listen(128)
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::BindError(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(|e| ServerError::BindError(addr, e))
}
