// ABOUTME: runs the privileged mediator daemon that validates and executes allow-listed commands.
// ABOUTME: exposes a local unix socket, reloads the allow-list on SIGHUP and removes the socket on shutdown.

mod audit;
mod config;
mod engine;
mod policy;
mod server;
mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::engine::Mediator;
use crate::policy::{AllowList, AllowListTable};
use crate::server::ServerContext;
use crate::supervisor::{Supervisor, SupervisorConfig};

#[derive(Debug, Parser)]
#[command(name = "savaletd", version, about = "Mediator daemon executing allow-listed commands over a unix socket")]
struct Args {
    #[arg(short, long, default_value = "/etc/savalet/daemon.toml")]
    config: PathBuf,

    /// Overrides socket_path from the config file.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[arg(long, value_parser = config::LOG_LEVELS)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Load the configuration, print the allow-list and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(&args.config)
        .with_context(|| format!("load configuration from {}", args.config.display()))?;
    let table = AllowListTable::from_config(&config.commands)
        .with_context(|| format!("build allow-list from {}", args.config.display()))?;

    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    if args.check_config {
        println!("configuration ok: {}", args.config.display());
        println!("socket: {}", config.socket_path.display());
        for name in table.names() {
            println!("allow: {name}");
        }
        return Ok(());
    }

    init_logging(&config.log_level, args.log_file.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting savaletd");
    info!(socket = %config.socket_path.display(), commands = table.len(), "configuration loaded");

    let allow_list = Arc::new(AllowList::new(table));
    let supervisor = Arc::new(Supervisor::new(SupervisorConfig::from(&config)));
    let ctx = Arc::new(ServerContext {
        mediator: Mediator::new(Arc::clone(&allow_list), supervisor),
        audit_path: config.audit_path.clone(),
    });

    tokio::spawn(reload_on_hangup(args.config.clone(), Arc::clone(&allow_list)));

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let outcome = tokio::select! {
        res = server::run(&config.socket_path, config.socket_mode, ctx) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("SIGTERM received, shutting down");
            Ok(())
        }
    };

    if config.socket_path.exists() {
        let _ = tokio::fs::remove_file(&config.socket_path).await;
    }
    outcome
}

fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("savaletd={level}")));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Rebuilds the allow-list from the config file on every SIGHUP; a bad file keeps the current table.
async fn reload_on_hangup(config_path: PathBuf, allow_list: Arc<AllowList>) {
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "install SIGHUP handler failed, reload disabled");
            return;
        }
    };

    while hangups.recv().await.is_some() {
        let reloaded = DaemonConfig::load(&config_path).and_then(|c| AllowListTable::from_config(&c.commands));
        match reloaded {
            Ok(table) => {
                info!(commands = table.len(), "allow-list reloaded");
                allow_list.replace(table);
            }
            Err(err) => {
                error!(error = %err, path = %config_path.display(), "reload failed, keeping previous allow-list");
            }
        }
    }
}
