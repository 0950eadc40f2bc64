//! core0 — the supervisory host agent.
//!
//! Creates, supervises and tears down containers on this node. Commands
//! arrive as newline-terminated JSON on the host socket; the same socket
//! is bound into every container at `/redis.socket`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use core_containers::{ContainerManager, ContainersSubsystem, Registry};
use core_proto::{frame, Command, JobResult};

mod config;
mod options;
mod pm;

use config::Config;
use options::Options;
use pm::SystemProcessManager;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    let violations = options.validate();
    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("Validation Error: {violation}");
        }
        std::process::exit(1);
    }

    let config = Config::load_from(&options.config).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!(gid = options.gid, nid = options.nid, "core0 starting");
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let settings = config.container_settings();
    let socket_path = settings.socket_path.clone();

    let pm = Arc::new(SystemProcessManager::new());
    let manager = ContainerManager::new(pm, settings);

    // No container state survives a restart; anything matching our name
    // patterns belongs to a dead run.
    manager.prune_leftovers().await;

    let mut registry = Registry::new();
    registry.register("container", ContainersSubsystem::new(Arc::clone(&manager)));
    let registry = Arc::new(registry);

    let _ = std::fs::remove_file(&socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "command socket listening");

    let accept = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, Arc::clone(&registry)));
                    }
                    Err(e) => {
                        error!("accept: {e}");
                        break;
                    }
                }
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    accept.abort();

    for (&id, _) in &manager.list() {
        if let Err(e) = manager.terminate(id).await {
            warn!("terminating container {id}: {e}");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("removing socket {}: {e}", socket_path.display());
        }
    }

    info!("core0 stopped");
    Ok(())
}

/// One command per line in, one result per line out.
async fn serve_connection(stream: UnixStream, registry: Arc<Registry>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let result = match frame::from_line::<Command>(&line) {
                    Ok(cmd) => registry.dispatch(cmd).await,
                    Err(e) => JobResult::error(String::new(), e.to_string()),
                };
                match frame::to_line(&result) {
                    Ok(reply) => {
                        if write.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!("encoding result: {e}"),
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("command socket read: {e}");
                return;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
