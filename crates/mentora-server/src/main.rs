use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mentora_queue::Coordinator;
use mentora_server::config::Config;
use mentora_server::{app, build_state};

#[derive(Parser)]
#[command(name = "mentora-server", about = "Mentora learning platform backend")]
struct Args {
    /// Path to a TOML configuration file. `MENTORA_*` environment
    /// variables override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for rotating log files; stdout only when unset.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mentora-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    let config = Config::load(args.config.as_deref())?;
    let state = build_state(config)?;
    let config = state.config.clone();

    // Join the node roster and keep the heartbeat alive.
    let role = config.node.role();
    state
        .registry
        .register(
            &config.node.host,
            config.node.port,
            role,
            state.worker.capabilities(),
            &config.node.region,
        )
        .await?;
    state.registry.clone().spawn_heartbeat();

    // Exactly one coordinator per queue instance; the role gate plus
    // the leadership marker enforce it.
    let shutdown = CancellationToken::new();
    if role.runs_coordinator() {
        let coordinator = Coordinator::new(state.queue.store(), state.registry.clone());
        let token = shutdown.clone();
        tokio::spawn(async move { coordinator.run(token).await });
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, role = role.as_str(), "mentora-server listening");

    let registry = state.registry.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    registry.unregister().await?;
    Ok(())
}
