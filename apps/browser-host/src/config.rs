use anyhow::{ensure, Context, Result};
use clap::Parser;
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Parser)]
#[command(
    name = "browser-host",
    author,
    version,
    about = "Streams a headless browser over WebSocket and forwards viewer input via CDP"
)]
pub struct Cli {
    /// Port the viewer-facing websocket listens on.
    #[arg(long, env = "BROWSER_STREAMING_PORT", default_value_t = 8933)]
    pub port: u16,

    /// Interface to bind the websocket listener to.
    #[arg(long, env = "BROWSER_STREAMING_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Debug port probed when no browser process is visible in the process table.
    #[arg(long, env = "CHROME_CDP_PORT", default_value_t = 9222)]
    pub cdp_port: u16,

    /// Executable names recognised as the browser during discovery.
    #[arg(
        long = "browser-process",
        env = "BROWSER_PROCESS_NAMES",
        value_delimiter = ',',
        default_value = "chrome,chromium,chromium-browser,google-chrome,headless_shell"
    )]
    pub browser_processes: Vec<String>,

    /// Discovery attempts before start-streaming gives up.
    #[arg(long, env = "CDP_DISCOVERY_ATTEMPTS", default_value_t = 15)]
    pub discovery_attempts: u32,

    /// Pause between discovery attempts.
    #[arg(long, env = "CDP_DISCOVERY_INTERVAL_MS", default_value_t = 1500)]
    pub discovery_interval_ms: u64,

    /// Delay before querying a freshly found debug port.
    #[arg(long, env = "CDP_DISCOVERY_WARMUP_MS", default_value_t = 500)]
    pub discovery_warmup_ms: u64,

    /// Upper bound on a single CDP command round trip.
    #[arg(long, env = "CDP_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub cdp_call_timeout_secs: u64,

    /// JPEG quality requested from Page.startScreencast.
    #[arg(long, env = "BROWSER_FRAME_QUALITY", default_value_t = 80)]
    pub frame_quality: u8,

    #[arg(long, env = "BROWSER_FRAME_MAX_WIDTH", default_value_t = 1280)]
    pub frame_max_width: u32,

    #[arg(long, env = "BROWSER_FRAME_MAX_HEIGHT", default_value_t = 720)]
    pub frame_max_height: u32,

    /// Depth of the CDP event queue and of each viewer's outbound queue.
    #[arg(long, env = "BROWSER_FRAME_BUFFER", default_value_t = 32)]
    pub frame_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addr: SocketAddr,
    pub discovery: DiscoveryPolicy,
    pub locator: LocatorConfig,
    pub screencast: ScreencastSettings,
    pub cdp_call_timeout: Duration,
    pub frame_buffer: usize,
}

/// Bounded polling applied around endpoint discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl DiscoveryPolicy {
    /// Wall-clock limit for one discovery run.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocatorConfig {
    pub process_names: Vec<String>,
    pub fallback_port: u16,
    pub warmup: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            process_names: ["chrome", "chromium", "chromium-browser", "google-chrome", "headless_shell"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            fallback_port: 9222,
            warmup: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreencastSettings {
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub every_nth_frame: u32,
}

impl Default for ScreencastSettings {
    fn default() -> Self {
        Self {
            quality: 80,
            max_width: 1280,
            max_height: 720,
            every_nth_frame: 1,
        }
    }
}

impl ScreencastSettings {
    pub fn start_params(&self) -> serde_json::Value {
        serde_json::json!({
            "format": "jpeg",
            "quality": self.quality,
            "maxWidth": self.max_width,
            "maxHeight": self.max_height,
            "everyNthFrame": self.every_nth_frame,
        })
    }
}

impl TryFrom<Cli> for HostConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let raw_addr = format!("{}:{}", cli.bind_host, cli.port);
        let listen_addr: SocketAddr = raw_addr
            .parse()
            .with_context(|| format!("invalid listen address: {raw_addr}"))?;
        ensure!(cli.discovery_attempts > 0, "discovery attempts must be positive");
        ensure!(cli.discovery_interval_ms > 0, "discovery interval must be positive");
        ensure!(cli.frame_buffer > 0, "frame buffer must be positive");
        ensure!(
            (1..=100).contains(&cli.frame_quality),
            "frame quality must be within 1..=100"
        );

        let process_names = cli
            .browser_processes
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>();
        ensure!(!process_names.is_empty(), "at least one browser process name is required");

        Ok(HostConfig {
            listen_addr,
            discovery: DiscoveryPolicy {
                attempts: cli.discovery_attempts,
                interval: Duration::from_millis(cli.discovery_interval_ms),
            },
            locator: LocatorConfig {
                process_names,
                fallback_port: cli.cdp_port,
                warmup: Duration::from_millis(cli.discovery_warmup_ms),
            },
            screencast: ScreencastSettings {
                quality: cli.frame_quality,
                max_width: cli.frame_max_width,
                max_height: cli.frame_max_height,
                every_nth_frame: 1,
            },
            cdp_call_timeout: Duration::from_secs(cli.cdp_call_timeout_secs),
            frame_buffer: cli.frame_buffer,
        })
    }
}
