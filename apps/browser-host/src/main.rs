use anyhow::{Context, Result};
use browser_host::{
    cdp::WsCdpConnector,
    config::{Cli, HostConfig},
    discovery::ProcessLocator,
    router,
    telemetry::Telemetry,
    AppState, HostSettings, StreamingHost,
};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = HostConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        fallback_cdp_port = config.locator.fallback_port,
        discovery_attempts = config.discovery.attempts,
        "starting browser-host"
    );

    let host = StreamingHost::new(
        Arc::new(ProcessLocator::new(config.locator.clone())),
        Arc::new(WsCdpConnector::new(config.cdp_call_timeout)),
        HostSettings::from(&config),
    );
    let app = router(AppState {
        host: host.clone(),
        metrics: Some(telemetry.metrics_handle()),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("browser-host listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown signal received; stopping sessions");
    host.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
