use anyhow::{Context, Result};
use browser_relay::{
    config::{Cli, RelayConfig},
    router,
    telemetry::Telemetry,
    RelayState,
};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    let telemetry = Telemetry::init(config.otel_stdout)?;
    info!(
        listen_addr = %config.listen_addr,
        backend = %config.backend_url(),
        "starting browser-relay"
    );

    let state = RelayState::new(&config, Some(telemetry.metrics_handle()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("browser-relay listening on {}", config.listen_addr);

    let shutdown_state = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; closing sessions");
            shutdown_state.shutdown();
        })
        .await
        .context("server shutdown with error")?;

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
