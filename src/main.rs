mod auth;
mod bus;
mod config;
mod error;
mod gateway;
mod metrics;
mod model;
mod query;
mod storage;
mod worker;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::{BusConsumer, InProcessBus, MessageBus};
use crate::gateway::GatewayContext;
use crate::metrics::AppMetrics;
use crate::query::QueryContext;
use crate::query::alerting::AlertEngine;
use crate::worker::StreamWorker;

/// Hard deadline for the worker to flush and commit on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(author, version, about = "vigil — application metrics observability backend")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env VIGIL_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(config::load_config(cli.config.as_deref())?);
    let metrics = AppMetrics::new()?;

    // Construction in leaf order: bus, store, then the components that
    // depend on them. Shutdown walks the same graph in reverse.
    let bus = Arc::new(InProcessBus::new(&config.bus));
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.subscribe());
    let store = storage::connect(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let stream_worker = StreamWorker::new(
        config.worker.clone(),
        consumer,
        store.clone(),
        metrics.clone(),
    );
    let mut worker_handle = tokio::spawn(stream_worker.run(shutdown_rx.clone()));

    let rollup_handle = worker::rollup::spawn(
        config.worker.rollup_interval,
        store.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    );

    let engine = AlertEngine::new(store.clone(), config.signals.clone(), metrics.clone());
    let alert_handle = query::alerting::spawn(engine, config.signals.eval_period, shutdown_rx.clone());

    let gateway_ctx = GatewayContext::new(
        config.clone(),
        bus.clone() as Arc<dyn MessageBus>,
        metrics.clone(),
    );
    let maintenance_handle = gateway::spawn_maintenance(gateway_ctx.clone(), shutdown_rx.clone());
    let ingest_router = gateway::create_router(gateway_ctx);

    let query_ctx = QueryContext {
        config: config.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
    };
    let query_router = query::create_router(query_ctx);

    let ingest_addr: SocketAddr = config
        .http
        .ingest_bind
        .parse()
        .context("invalid http.ingest_bind address")?;
    let query_addr: SocketAddr = config
        .http
        .query_bind
        .parse()
        .context("invalid http.query_bind address")?;

    let ingest_listener = tokio::net::TcpListener::bind(ingest_addr)
        .await
        .context("failed to bind ingest listener")?;
    let query_listener = tokio::net::TcpListener::bind(query_addr)
        .await
        .context("failed to bind query listener")?;

    info!(ingest = %ingest_addr, query = %query_addr, "vigil listening");

    let ingest_server = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            axum::serve(
                ingest_listener,
                ingest_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await
        }
    });
    let query_server = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            axum::serve(query_listener, query_router)
                .with_graceful_shutdown(wait_for_shutdown(shutdown))
                .await
        }
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // The worker flushes its in-memory batch and commits before exiting;
    // past the deadline, uncommitted records stay on the bus for redelivery.
    if tokio::time::timeout(SHUTDOWN_DEADLINE, &mut worker_handle)
        .await
        .is_err()
    {
        warn!("stream worker exceeded shutdown deadline; aborting");
        worker_handle.abort();
    }

    for handle in [rollup_handle, alert_handle, maintenance_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    for server in [ingest_server, query_server] {
        match tokio::time::timeout(Duration::from_secs(5), server).await {
            Ok(Ok(Err(err))) => error!(error = ?err, "server terminated with error"),
            Ok(_) => {}
            Err(_) => warn!("server did not drain before the deadline"),
        }
    }

    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vigil=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|requested| *requested).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
