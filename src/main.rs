// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cctv_relay::acceptor::{serve_viewers, viewer_router};
use cctv_relay::metrics::init_metrics;
use cctv_relay::server::{control_router, AppState};
use cctv_relay::{
    BroadcastRouter, ChannelRegistry, FfmpegCommand, RelayConfig, StreamSupervisor,
    SupervisorOptions,
};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cctv_relay=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stdout),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_ansi(false),
            )
            .init();
    }
}

async fn async_main() -> anyhow::Result<()> {
    init_tracing();
    info!("cctv-relay starting...");

    let metrics_handle = init_metrics().context("Failed to install Prometheus recorder")?;

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    info!(
        streams = config.streams.len(),
        control_port = config.control_port,
        viewer_port = config.viewer_port,
        retry_delay_secs = config.retry_delay.as_secs(),
        "Relay configuration loaded"
    );

    let registry = Arc::new(ChannelRegistry::new(config.subscriber_buffer));
    let router = BroadcastRouter::new(Arc::clone(&registry), &config.streams);
    let supervisor = StreamSupervisor::new(
        config.streams.clone(),
        Arc::new(FfmpegCommand::from_config(&config)),
        router,
        SupervisorOptions::from_config(&config),
    );

    // Bind everything before any transcoder starts so a port clash fails fast
    let shutdown = CancellationToken::new();
    let mut servers = Vec::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.viewer_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind viewer port {}", addr))?;
    info!("Viewers listening on ws://{}/?channel=<channel>", addr);
    servers.push(tokio::spawn(serve_viewers(
        listener,
        viewer_router(Arc::clone(&registry), None),
        shutdown.clone(),
    )));

    for def in &config.streams {
        let Some(port) = def.ws_port else {
            continue;
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind viewer port {} for {}", addr, def.id))?;
        info!(stream = %def.id, channel = %def.channel, "Dedicated viewer port on ws://{}", addr);
        servers.push(tokio::spawn(serve_viewers(
            listener,
            viewer_router(Arc::clone(&registry), Some(def.channel.clone())),
            shutdown.clone(),
        )));
    }

    let app = control_router(Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        registry: Arc::clone(&registry),
        metrics_handle,
    }));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.control_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control port {}", addr))?;
    info!("Control server listening on http://{}", addr);
    {
        let shutdown = shutdown.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }));
    }

    supervisor.start_all().await;

    shutdown_signal().await;
    info!("Shutting down gracefully...");

    let errors = supervisor.shutdown().await;
    if !errors.is_empty() {
        error!(count = errors.len(), "Some transcoders did not stop cleanly");
    }
    registry.close_all().await;
    shutdown.cancel();

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener error: {}", e),
            Err(e) => error!("Listener task failed: {}", e),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
