use anyhow::{ensure, Context, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Parser)]
#[command(
    name = "browser-relay",
    author,
    version,
    about = "Public websocket relay in front of the browser streaming host"
)]
pub struct Cli {
    /// Port the public websocket listens on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "BROWSER_RELAY_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Host running browser-host.
    #[arg(long, env = "BROWSER_STREAMING_HOST", default_value = "localhost")]
    pub backend_host: String,

    #[arg(long, env = "BROWSER_STREAMING_PORT", default_value_t = 8933)]
    pub backend_port: u16,

    /// How long a backend websocket handshake may take before the client is
    /// closed with an internal error.
    #[arg(long, env = "BROWSER_RELAY_BACKEND_TIMEOUT_SECS", default_value_t = 10)]
    pub backend_connect_timeout_secs: u64,

    /// Print per-connection spans through the OpenTelemetry stdout exporter.
    #[arg(
        long,
        env = "BROWSER_RELAY_OTEL_STDOUT",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub backend_host: String,
    pub backend_port: u16,
    pub backend_connect_timeout: Duration,
    pub otel_stdout: bool,
}

impl RelayConfig {
    pub fn backend_url(&self) -> String {
        format!("ws://{}:{}", self.backend_host, self.backend_port)
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let raw_addr = format!("{}:{}", cli.bind_host, cli.port);
        let listen_addr: SocketAddr = raw_addr
            .parse()
            .with_context(|| format!("invalid listen address: {raw_addr}"))?;
        let backend_host = cli.backend_host.trim().to_string();
        ensure!(!backend_host.is_empty(), "backend host must not be empty");
        ensure!(
            cli.backend_connect_timeout_secs > 0,
            "backend connect timeout must be positive"
        );

        Ok(RelayConfig {
            listen_addr,
            backend_host,
            backend_port: cli.backend_port,
            backend_connect_timeout: Duration::from_secs(cli.backend_connect_timeout_secs),
            otel_stdout: cli.otel_stdout,
        })
    }
}
