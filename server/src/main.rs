//! `sendit` binary: loads configuration and the host key, then runs the SSH
//! and HTTP listeners side by side until SIGINT/SIGTERM.
//!
//! ## Subcommands
//!
//! - `sendit serve` (default) — run both listeners
//! - `sendit check` — validate config and host key, then exit

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use sendit::config::{Config, ConfigError};
use sendit::session::SessionContext;
use sendit::ssh::{self, HostKeyError};
use sendit::{routes, AppState, Registry};

/// How long open sessions get to say goodbye after shutdown starts.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Webhook relay for terminals.
#[derive(Parser)]
#[command(name = "sendit", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the SSH and HTTP listeners (default when no subcommand given).
    Serve,
    /// Load the config and host key, report problems, and exit.
    Check,
}

/// Startup failures. These are the only errors that end the process.
#[derive(Debug, thiserror::Error)]
enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    HostKey(#[from] HostKeyError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Check => check(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn check(config: &Config) -> Result<(), BootError> {
    ssh::load_host_key(&config.ssh.host_key_path)?;
    info!(
        "Configuration OK (http {}, ssh {}, host key {})",
        config.http.listen, config.ssh.listen, config.ssh.host_key_path
    );
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener, BootError> {
    TcpListener::bind(addr).await.map_err(|source| BootError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn run_server(config: Config) -> Result<(), BootError> {
    info!("sendit v{} starting", env!("CARGO_PKG_VERSION"));

    let host_key = ssh::load_host_key(&config.ssh.host_key_path)?;
    info!("Loaded host key from {}", config.ssh.host_key_path);
    let ssh_config = Arc::new(ssh::server_config(&config.ssh, host_key));

    let http_listener = bind(&config.http.listen).await?;
    let ssh_listener = bind(&config.ssh.listen).await?;
    info!("HTTP listening on {}", config.http.listen);
    info!("SSH listening on {}", config.ssh.listen);
    info!("Callback URLs: {}/<id>", config.http.public_url.trim_end_matches('/'));

    let config = Arc::new(config);
    let registry = Registry::new(config.relay.channel_capacity);
    let shutdown = CancellationToken::new();
    let sessions = TaskTracker::new();

    let ssh_task = tokio::spawn(ssh::serve(
        ssh_listener,
        ssh_config,
        SessionContext {
            registry: registry.clone(),
            config: Arc::clone(&config),
            shutdown: shutdown.clone(),
            tasks: sessions.clone(),
        },
    ));

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let app = routes::router(AppState::new(Arc::clone(&config), registry.clone()));
    info!("Server ready");
    if let Err(e) = axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        error!("HTTP server error: {e}");
    }

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    let _ = ssh_task.await;
    sessions.close();
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.wait())
        .await
        .is_err()
    {
        warn!("{} sessions did not finish in time", sessions.len());
    }
    if !registry.is_empty() {
        warn!("{} identifiers still registered at exit", registry.len());
    }
    info!("Goodbye");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
