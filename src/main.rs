use anyhow::{Context, Result};
use autorclone::command::SyncCommand;
use autorclone::config::{Config, SyncAction};
use autorclone::controller::RotationController;
use autorclone::logging::rotating_log_file;
use autorclone::monitor::RcClient;
use autorclone::state::{FileLock, InstanceStateStore, JsonStateStore};
use autorclone::supervisor::{ProcessSupervisor, ShellSupervisor};
use clap::Parser;
use dotenvy::dotenv;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

#[derive(Parser)]
#[command(name = "autorclone")]
#[command(version, about = "Run rclone while rotating service accounts around quota limits")]
struct Cli {
    /// Source path or remote
    src: String,

    /// Destination remote
    dst: String,

    /// rclone action to run
    #[arg(long, value_enum, default_value_t = SyncAction::Copy)]
    action: SyncAction,

    /// File list handed to rclone's --files-from
    #[arg(long)]
    files_from: Option<PathBuf>,

    /// Pass --dry-run through to rclone
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .compact();

    let file = match log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
                .with_writer(Mutex::new(rotating_log_file(path))),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = dotenv();
    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(&config.log_level, config.script_log_file.as_deref())?;
    match env_file {
        Ok(path) => info!("Loaded environment from {:?}", path),
        Err(e) => warn!("No .env file loaded ({}) - relying on environment", e),
    }
    info!(rc_addr = %config.rc_addr, "Starting autorclone");
    let binary = config.resolve_rclone_binary()?;
    info!("Using rclone at {:?}", binary);

    let command = SyncCommand::new(&config, cli.action, &cli.src, &cli.dst)
        .with_files_from(cli.files_from)
        .with_dry_run(cli.dry_run);
    let supervisor = Arc::new(
        ShellSupervisor::new(command.binary_name()).with_session_marker(command.session_marker()),
    );
    let stats = Arc::new(RcClient::new(&config.rc_addr)?);
    let store = Arc::new(JsonStateStore::new(config.state_path.clone()));
    let mut lock = FileLock::new(config.lock_path.clone());

    let mut controller = RotationController::new(
        config,
        command,
        supervisor.clone() as Arc<dyn ProcessSupervisor>,
        stats,
        store.clone(),
    );

    tokio::select! {
        result = controller.run(&mut lock) => {
            if let Err(e) = &result {
                error!("autorclone stopped: {}", e);
            }
            result.map_err(Into::into)
        }
        _ = shutdown_signal() => {
            // Leave no orphaned rclone behind, even one launched but not yet recorded.
            supervisor.kill_live_sessions().await;
            if let Some(pid) = store.load().ok().and_then(|s| s.last_pid) {
                supervisor.kill_tree(pid).await;
            }
            Ok(())
        }
    }
}
