//! Skiff - Shadowsocks tunnel manager.
//!
//! `skiff run` brings the tunnel up and keeps it up until Ctrl-C or a
//! termination signal:
//! - Restores proxy settings left behind by a crash
//! - Starts `sslocal` and applies the routing mode
//! - Optionally refreshes the managed PAC on a timer
//!
//! The other subcommands inspect or edit the stored configuration.

use std::panic;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use skiff_app::{export_bundle, shutdown_signal, AppContext, DiagnosticsSnapshot};
use skiff_core::{AppSettings, OrchestratorCommand, PacProfile, RoutingMode};
use skiff_storage::AppPaths;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for a queued disconnect before rolling back directly.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Skiff - Shadowsocks tunnel manager
#[derive(Parser, Debug)]
#[command(name = "skiff", version, about)]
struct Args {
    /// Application data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and stay connected until Ctrl-C or termination
    Run {
        /// Regenerate the managed PAC every update interval
        #[arg(long)]
        pac_refresh: bool,

        /// Also log to the console
        #[arg(long)]
        foreground: bool,
    },
    /// Restore proxy settings left behind by a previous run
    Recover,
    /// Managed PAC tools
    Pac {
        #[command(subcommand)]
        action: PacCommand,
    },
    /// Add a server from an ss:// URI
    Import {
        uri: String,

        /// Make the imported server active
        #[arg(long)]
        activate: bool,
    },
    /// Print a server profile as an ss:// URI
    Export { profile_id: String },
    /// Save the routing mode
    Routing {
        #[arg(value_enum)]
        mode: RoutingArg,
    },
    /// Print a diagnostics report
    Diagnostics {
        /// Also write a support bundle into this directory
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum PacCommand {
    /// Regenerate and print the managed script
    Preview,
    /// Show how a URL or host would be routed
    Test { input: String },
    /// List PAC presets
    Presets,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoutingArg {
    Off,
    Global,
    Pac,
}

impl From<RoutingArg> for RoutingMode {
    fn from(arg: RoutingArg) -> Self {
        match arg {
            RoutingArg::Off => RoutingMode::Off,
            RoutingArg::Global => RoutingMode::Global,
            RoutingArg::Pac => RoutingMode::Pac,
        }
    }
}

/// Initialize logging with file rotation.
fn init_logging(
    log_dir: &Path,
    log_level: &str,
    console: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skiff={},warn", log_level)));

    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("skiff")
            .filename_suffix("log")
            .build(log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            if console {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            }

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn install_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));
}

/// Connects, then waits for a shutdown signal and tears the tunnel down.
async fn run(ctx: &AppContext, pac_refresh: bool) -> anyhow::Result<()> {
    let recovery = ctx.orchestrator.recover_proxy().await;
    if !recovery.success() {
        tracing::warn!("Proxy recovery failed: {}", recovery.message);
    }

    let shutdown = CancellationToken::new();

    let mut states = ctx.orchestrator.subscribe();
    let state_shutdown = shutdown.clone();
    let state_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state_shutdown.cancelled() => break,
                received = states.recv() => match received {
                    Ok(snapshot) => println!("[{}] {}", snapshot.state, snapshot.message),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("State stream lagged by {} updates", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    // Registered before connecting so a signal during connect is not fatal.
    let signal_task = tokio::spawn(shutdown_signal());

    let connected = ctx.orchestrator.connect().await;
    if !connected.success() {
        signal_task.abort();
        shutdown.cancel();
        let _ = state_task.await;
        return Err(anyhow!("Connect failed: {}", connected.message));
    }

    let refresh_task = if pac_refresh {
        match ctx.active_pac_profile().await {
            Ok((_, profile)) => Some(spawn_pac_refresh(ctx, &profile, shutdown.clone())),
            Err(e) => {
                tracing::warn!("PAC refresh disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let signal = signal_task.await.map_err(anyhow::Error::from).and_then(|r| r);
    shutdown.cancel();
    match &signal {
        Ok(name) => tracing::info!("{} received, disconnecting", name),
        Err(e) => tracing::error!("{:#}, disconnecting", e),
    }
    ctx.shutdown_tunnel(DISCONNECT_TIMEOUT).await;

    if let Some(task) = refresh_task {
        let _ = task.await;
    }
    let _ = state_task.await;
    signal.map(|_| ())
}

fn spawn_pac_refresh(
    ctx: &AppContext,
    profile: &PacProfile,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let hours = u64::from(profile.update_interval_hours.max(1));
    let period = Duration::from_secs(hours * 3600);
    let orchestrator = ctx.orchestrator.clone();
    tracing::info!("PAC refresh every {} hours", hours);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = orchestrator
                        .submit(OrchestratorCommand::UpdatePac, shutdown.child_token())
                        .wait()
                        .await;
                    tracing::info!("Scheduled PAC refresh: {}", result.message);
                }
            }
        }
    })
}

/// Regenerates the active managed profile so the last-good script is current.
async fn refresh_active_pac(ctx: &AppContext) -> anyhow::Result<(AppSettings, PacProfile)> {
    let (settings, profile) = ctx.active_pac_profile().await?;
    if profile.is_managed() {
        let update = ctx.pac.update(&profile, settings.ports.socks_port).await;
        if !update.applied {
            eprintln!("{}", update.message);
        }
    }
    Ok((settings, profile))
}

async fn pac(ctx: &AppContext, action: PacCommand) -> anyhow::Result<()> {
    match action {
        PacCommand::Preview => {
            refresh_active_pac(ctx).await?;
            println!("{}", ctx.pac.preview());
        }
        PacCommand::Test { input } => {
            let (settings, profile) = refresh_active_pac(ctx).await?;
            let evaluation = ctx.pac.test(&profile, &input, settings.ports.socks_port);
            println!("{}", evaluation.decision);
            println!("{}", evaluation.reason);
        }
        PacCommand::Presets => {
            for preset in ctx.pac.presets().await {
                println!("{}\t{}\t{}", preset.id, preset.name, preset.source_url);
            }
        }
    }
    Ok(())
}

async fn diagnostics(ctx: &AppContext, bundle: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = ctx.load_settings().await?;
    let snapshot = DiagnosticsSnapshot::collect(
        &settings,
        &ctx.orchestrator.snapshot(),
        &ctx.paths.logs,
        settings.diagnostics_log_tail_lines,
    );
    print!("{}", snapshot.report_text());

    if let Some(dir) = bundle {
        let logs = ctx.paths.logs.clone();
        let path = tokio::task::spawn_blocking(move || export_bundle(&snapshot, &settings, &logs, &dir))
            .await??;
        println!("Bundle written to {}", path.display());
    }
    Ok(())
}

async fn dispatch(ctx: &AppContext, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { pac_refresh, .. } => run(ctx, pac_refresh).await,
        Command::Recover => {
            let result = ctx.orchestrator.recover_proxy().await;
            println!("{}", result.message);
            if result.success() {
                Ok(())
            } else {
                Err(anyhow!(result.message))
            }
        }
        Command::Pac { action } => pac(ctx, action).await,
        Command::Import { uri, activate } => {
            let profile = ctx.import_server(&uri, activate).await?;
            println!("Imported {} ({})", profile.name, profile.id);
            Ok(())
        }
        Command::Export { profile_id } => {
            println!("{}", ctx.export_server(&profile_id).await?);
            Ok(())
        }
        Command::Routing { mode } => {
            let settings = ctx.set_routing_mode(mode.into()).await?;
            println!("Routing mode: {}", settings.routing_mode);
            Ok(())
        }
        Command::Diagnostics { bundle } => diagnostics(ctx, bundle).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run {
        pac_refresh: false,
        foreground: false,
    });

    let paths = match &args.data_dir {
        Some(dir) => AppPaths::under(dir),
        None => AppPaths::discover()?,
    };

    let log_level = if args.debug { "debug" } else { &args.log_level };
    let console = args.debug || matches!(command, Command::Run { foreground: true, .. });
    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&paths.logs, log_level, console);
    install_panic_hook();

    tracing::info!("Starting Skiff {}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Command: {:?}", command);

    let ctx = AppContext::open(paths)?;
    let outcome = dispatch(&ctx, command).await;
    ctx.orchestrator.shutdown().await;

    tracing::info!("Skiff shutting down");
    outcome
}
