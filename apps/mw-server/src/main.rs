use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use mw_core::{default_process_identity, HeartbeatPublisher, TaskManager};
use mw_events::LocalBus;
use mw_kernel::Kernel;
use mw_server::{build_router, AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    mw_otel::init();
    if let Err(err) = run().await {
        error!("mw-server failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = mw_core::load_from_env().context("load configuration")?;
    let state_dir = config.state_dir();
    let kernel = Kernel::open(&state_dir)
        .with_context(|| format!("open store in {}", state_dir.display()))?;
    info!(db = %kernel.db_path().display(), "store opened");

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("parse bind address")?;
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let bus = LocalBus::new(config.server.bus_capacity);
    let state = AppState::new(kernel, bus, config);

    let mut background = TaskManager::new();
    if state.config().worker.embedded {
        let identity = state
            .config()
            .liveness
            .process_identity
            .clone()
            .unwrap_or_else(default_process_identity);
        let publisher = Arc::new(HeartbeatPublisher::new(
            state.kernel().clone(),
            state.config().liveness.period(),
            identity,
        ));
        background.push(publisher.spawn(state.shutdown_token().child_token()));
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "mw-server listening");

    let app = build_router(state.clone());
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state.clone()));
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    // Sessions and the heartbeat hang off this token.
    state.shutdown_token().cancel();
    state.bus().close();
    info!("shutting down background tasks");
    background.shutdown_with_grace(grace).await;
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    info!("shutdown signal listener active");
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
    // Open SSE responses never finish on their own; end them so the
    // graceful drain can complete.
    state.shutdown_token().cancel();
}
