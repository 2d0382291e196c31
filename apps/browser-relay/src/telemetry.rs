//! Logging, metrics, and optional span export for the relay.
//!
//! Each relayed connection runs inside a `relay.connection` span (with
//! `relay.backend_connect` nested under it). When span export is on, those
//! spans are also written to stdout through the OpenTelemetry exporter.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "browser-relay";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    span_exporter: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(export_spans: bool) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let span_exporter = export_spans.then(stdout_provider);
        let otel = span_exporter.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &span_exporter {
            global::set_tracer_provider(provider.clone());
            info!("exporting relay connection spans to stdout");
        }

        Ok(Self {
            metrics_handle,
            span_exporter,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        // Flushes spans of connections that were still open at shutdown.
        if let Some(provider) = self.span_exporter.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter did not shut down cleanly");
            }
        }
    }
}

fn stdout_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}
