#![forbid(unsafe_code)]

//! `trace-engine`: instrumentation session server binary.
//!
//! Bootstraps configuration, builds the engine, and serves the IPC
//! surface used by `trace-engine-ctl` until a shutdown signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use trace_engine::config::GlobalConfig;
use trace_engine::ipc::server::spawn_ipc_server;
use trace_engine::ipc::state::AppState;
use trace_engine::orchestrator::engine::TraceEngine;
use trace_engine::orchestrator::listeners::LoggingListener;
use trace_engine::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "trace-engine", about = "Dynamic instrumentation session server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the IPC socket name from the configuration.
    #[arg(long)]
    ipc_name: Option<String>,

    /// Enable agent debug output for every task.
    #[arg(long)]
    debug_agent: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("trace-engine bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(name) = args.ipc_name {
        config.ipc_name = name;
    }
    if args.debug_agent {
        config.trace.debug = true;
    }
    info!(ipc_name = %config.ipc_name, "configuration loaded");

    let engine = TraceEngine::from_config(&config)?;
    engine.add_listener(Arc::new(LoggingListener));

    let ipc_auth_token = uuid::Uuid::new_v4().to_string();
    let token_path = token_file_path(&args.config, &config.ipc_name);
    write_token_file(&token_path, &ipc_auth_token)?;
    info!(path = %token_path.display(), "IPC auth token written");

    let state = Arc::new(AppState::new(engine, config.ipc_name.clone(), Some(ipc_auth_token)));

    let ct = CancellationToken::new();
    let ipc_handle = spawn_ipc_server(Arc::clone(&state), ct.clone())?;
    info!("trace-engine ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let stopped = state.stop_all().await;
    info!(stopped, "graceful shutdown complete");

    if let Err(err) = ipc_handle.await {
        error!(%err, "IPC server task failed");
    }
    if let Err(err) = std::fs::remove_file(&token_path) {
        warn!(%err, path = %token_path.display(), "failed to remove IPC token file");
    }
    info!("trace-engine shut down");

    Ok(())
}

/// Token file placed next to the configuration file.
fn token_file_path(config_path: &Path, ipc_name: &str) -> PathBuf {
    config_path.with_file_name(format!("{ipc_name}.token"))
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, token)
        .map_err(|err| AppError::Ipc(format!("failed to write token file {}: {err}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
