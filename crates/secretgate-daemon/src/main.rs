//! secretgate-daemon - Secret Service approval proxy.
//!
//! Watches the discovery directory for client endpoints, runs one Secret
//! Service proxy per endpoint, and serves the operator and session control
//! sockets.
//!
//! The tokio runtime is built by hand from a synchronous `main` so argument
//! parsing and configuration errors are reported before any thread starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secretgate_core::config::GatewayConfig;
use secretgate_core::process::{LocalPeerStrategy, ProcfsSource};
use secretgate_daemon::discovery::DiscoveryManager;
use secretgate_daemon::gateway::ApprovalGateway;
use secretgate_daemon::protocol::{self, ControlContext, SocketManager, SocketManagerConfig};
use secretgate_daemon::proxy::DbusProxyFactory;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Grace period for proxies and control connections after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "secretgate-daemon")]
#[command(version, about = "Secret Service proxy with human approval of secret access")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory watched for client endpoints (overrides the config file)
    #[arg(long)]
    discovery_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or an `EnvFilter` directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(directory) = &args.discovery_dir {
        config.discovery.directory.clone_from(directory);
    }
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn async_main(args: Args, config: GatewayConfig) -> Result<()> {
    init_logging(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        discovery_dir = %config.discovery.directory.display(),
        approval_enabled = config.approval.enabled,
        "starting secretgate-daemon"
    );
    if !config.approval.enabled {
        warn!("approval is disabled, every request will be allowed");
    }

    let root = CancellationToken::new();
    let gateway = Arc::new(ApprovalGateway::from_config(&config.approval));

    let factory = DbusProxyFactory::new(config.upstream.address.clone(), Arc::clone(&gateway))
        .with_gate_writes(config.approval.gate_writes)
        .with_departed_retention(config.tracker.departed_retention());
    let discovery = Arc::new(DiscoveryManager::new(
        &config.discovery,
        Arc::new(factory),
        &root,
    ));

    let sockets = SocketManager::bind(SocketManagerConfig::from_daemon_config(&config.daemon))
        .context("failed to bind control sockets")?;
    info!(
        operator = %sockets.operator_socket_path().display(),
        session = %sockets.session_socket_path().display(),
        "control sockets bound"
    );
    let control = Arc::new(
        ControlContext::new(
            Arc::clone(&gateway),
            Arc::clone(discovery.registry()),
            Arc::new(ProcfsSource::new()),
            root.child_token(),
        )
        .with_local_peer(LocalPeerStrategy::new(config.daemon.local_peer_skip)),
    );
    let control_task = tokio::spawn(protocol::serve(Arc::new(sockets), control));
    let mut discovery_task = tokio::spawn(Arc::clone(&discovery).run());

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let mut discovery_done = false;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        result = &mut discovery_task => {
            discovery_done = true;
            match result {
                Ok(Ok(())) => warn!("discovery manager exited"),
                Ok(Err(e)) => error!(error = %e, "discovery manager failed"),
                Err(e) => error!(error = %e, "discovery manager panicked"),
            }
        }
    }

    root.cancel();
    let drain = async {
        if !discovery_done {
            if let Err(e) = discovery_task.await {
                warn!(error = %e, "discovery task failed during shutdown");
            }
        }
        discovery.shutdown().await;
        if let Err(e) = control_task.await {
            warn!(error = %e, "control task failed during shutdown");
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed with tasks still running");
    }

    info!("secretgate-daemon stopped");
    Ok(())
}
