use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mw_core::{default_process_identity, Config, HeartbeatPublisher, TaskManager};
use mw_kernel::Kernel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "mw-worker",
    version,
    about = "Background worker process: publishes the liveness heartbeat"
)]
struct Args {
    /// Configuration file (defaults to MW_CONFIG or ./mirrorwatch.toml)
    #[arg(long, env = "MW_CONFIG")]
    config: Option<PathBuf>,
    /// Directory holding the shared store
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Seconds between heartbeats
    #[arg(long)]
    period_secs: Option<u64>,
    /// Process identity written into the liveness record
    #[arg(long)]
    identity: Option<String>,
}

impl Args {
    fn resolve_config(&self) -> Result<Config> {
        let cfg = match &self.config {
            Some(path) => {
                let mut cfg = mw_core::load_config(path)
                    .with_context(|| format!("load config {}", path.display()))?;
                cfg.apply_env_overrides();
                cfg
            }
            None => mw_core::load_from_env().context("load configuration")?,
        };
        self.overlay(cfg)
    }

    /// Apply command-line flags on top of a loaded configuration.
    fn overlay(&self, mut cfg: Config) -> Result<Config> {
        if let Some(dir) = &self.state_dir {
            cfg.store.state_dir = dir.display().to_string();
        }
        if let Some(period) = self.period_secs {
            cfg.liveness.period_secs = period;
        }
        if let Some(identity) = &self.identity {
            cfg.liveness.process_identity = Some(identity.clone());
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() {
    mw_otel::init();
    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("mw-worker failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = args.resolve_config()?;
    let state_dir = cfg.state_dir();
    let kernel = Kernel::open(&state_dir)
        .with_context(|| format!("open store in {}", state_dir.display()))?;
    let identity = cfg
        .liveness
        .process_identity
        .clone()
        .unwrap_or_else(default_process_identity);

    let publisher = Arc::new(HeartbeatPublisher::new(
        Arc::new(kernel),
        cfg.liveness.period(),
        identity,
    ));
    let cancel = CancellationToken::new();
    let mut tasks = TaskManager::new();
    tasks.push(publisher.clone().spawn(cancel.clone()));
    info!(identity = %publisher.identity(), "mw-worker running");

    shutdown_signal().await;
    cancel.cancel();
    tasks
        .shutdown_with_grace(Duration::from_secs(cfg.server.shutdown_grace_secs))
        .await;
    info!("mw-worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!("install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
