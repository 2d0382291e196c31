//! Locates the debug websocket of the locally running browser.
//!
//! Discovery is a two step probe: find the `--remote-debugging-port` of a
//! browser process, then ask that port for its page targets. Either step
//! may legitimately come back empty while the browser is still booting, so
//! a single probe returns `Ok(None)` and [`discover_with_retry`] owns the
//! polling budget.

use async_trait::async_trait;
use serde::Deserialize;
use std::{ffi::OsStr, path::Path, time::Duration};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryPolicy, LocatorConfig};

const DEBUG_PORT_FLAG: &str = "--remote-debugging-port";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no CDP page target found after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("failed to query CDP targets on port {port}: {source}")]
    Http {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
}

/// One entry of the `/json/list` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpTarget {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

#[async_trait]
pub trait EndpointLocator: Send + Sync {
    /// Single discovery probe. `Ok(None)` means "not ready yet".
    async fn locate(&self) -> Result<Option<String>, DiscoveryError>;
}

pub struct ProcessLocator {
    config: LocatorConfig,
    http: reqwest::Client,
}

impl ProcessLocator {
    pub fn new(config: LocatorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn browser_debug_port(&self) -> Option<u16> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        system.processes().values().find_map(|process| {
            let args: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            let is_browser = is_browser_process(process.name(), &args, &self.config.process_names);
            if is_browser {
                parse_debug_port(&args)
            } else {
                None
            }
        })
    }

    async fn list_targets(&self, port: u16) -> Result<Vec<CdpTarget>, DiscoveryError> {
        let url = format!("http://127.0.0.1:{port}/json/list");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| DiscoveryError::Http { port, source })?;
        response
            .json::<Vec<CdpTarget>>()
            .await
            .map_err(|source| DiscoveryError::Http { port, source })
    }
}

#[async_trait]
impl EndpointLocator for ProcessLocator {
    async fn locate(&self) -> Result<Option<String>, DiscoveryError> {
        let port = match self.browser_debug_port() {
            Some(port) => {
                debug!(port, "found browser process with remote debugging port");
                // A just-launched browser may not serve /json/list yet.
                tokio::time::sleep(self.config.warmup).await;
                port
            }
            None => {
                debug!(
                    port = self.config.fallback_port,
                    "no browser process visible; probing fallback debug port"
                );
                self.config.fallback_port
            }
        };

        let targets = self.list_targets(port).await?;
        Ok(first_page_target(&targets)
            .and_then(|target| target.web_socket_debugger_url.clone()))
    }
}

/// Polls `locator` until it yields an endpoint or the policy runs out. The
/// whole search, every lookup included, is bounded by [`DiscoveryPolicy::budget`].
pub async fn discover_with_retry(
    locator: &dyn EndpointLocator,
    policy: &DiscoveryPolicy,
) -> Result<String, DiscoveryError> {
    let exhausted = DiscoveryError::Exhausted {
        attempts: policy.attempts,
    };
    match tokio::time::timeout(policy.budget(), poll_locator(locator, policy)).await {
        Ok(Some(endpoint)) => Ok(endpoint),
        Ok(None) => Err(exhausted),
        Err(_) => {
            warn!(budget = ?policy.budget(), "CDP discovery ran out of time");
            Err(exhausted)
        }
    }
}

async fn poll_locator(locator: &dyn EndpointLocator, policy: &DiscoveryPolicy) -> Option<String> {
    for attempt in 1..=policy.attempts {
        match locator.locate().await {
            Ok(Some(endpoint)) => {
                info!(attempt, endpoint = %endpoint, "discovered CDP endpoint");
                return Some(endpoint);
            }
            Ok(None) => debug!(attempt, "CDP endpoint not ready"),
            Err(err) => warn!(attempt, error = %err, "CDP discovery probe failed"),
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    None
}

pub fn first_page_target(targets: &[CdpTarget]) -> Option<&CdpTarget> {
    targets
        .iter()
        .find(|target| target.target_type == "page" && target.web_socket_debugger_url.is_some())
}

/// Extracts the port from `--remote-debugging-port=N` or `--remote-debugging-port N`.
pub fn parse_debug_port<S: AsRef<str>>(args: &[S]) -> Option<u16> {
    let mut iter = args.iter().map(AsRef::as_ref);
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix(DEBUG_PORT_FLAG) {
            let value = match value.strip_prefix('=') {
                Some(inline) => inline,
                None if value.is_empty() => match iter.next() {
                    Some(next) => next,
                    None => return None,
                },
                None => continue,
            };
            // Port 0 asks the browser to pick one; it is not connectable as-is.
            match value.trim().parse::<u16>() {
                Ok(0) | Err(_) => continue,
                Ok(port) => return Some(port),
            }
        }
    }
    None
}

pub fn is_browser_process<S: AsRef<str>>(name: &OsStr, args: &[S], names: &[String]) -> bool {
    let process_name = name.to_string_lossy();
    let executable = args
        .first()
        .and_then(|arg0| Path::new(arg0.as_ref()).file_name())
        .map(|file| file.to_string_lossy().into_owned())
        .unwrap_or_default();
    names.iter().any(|candidate| {
        process_name.eq_ignore_ascii_case(candidate) || executable.eq_ignore_ascii_case(candidate)
    })
}
