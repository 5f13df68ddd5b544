// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::{self as sdktrace, SdkTracerProvider},
    Resource,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::config::TelemetryConfig;

const SERVICE_NAME: &str = "framelink";

fn resource() -> Resource {
    Resource::builder_empty()
        .with_attributes([
            opentelemetry::KeyValue::new("service.name", SERVICE_NAME),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

fn build_metric_exporter(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::MetricExporter, Box<dyn std::error::Error>> {
    let mut builder = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        tracing::info!(headers = headers.len(), "Adding custom headers to OTLP metrics exporter");
        builder = builder.with_headers(headers.clone());
    }

    builder.build().map_err(|e| {
        tracing::error!(error = %e, "Failed to build OTLP metrics exporter");
        e.into()
    })
}

fn build_span_exporter(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::SpanExporter, Box<dyn std::error::Error>> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        tracing::info!(headers = headers.len(), "Adding custom headers to OTLP trace exporter");
        builder = builder.with_headers(headers.clone());
    }

    builder.build().map_err(|e| {
        tracing::error!(error = %e, "Failed to build OTLP trace exporter");
        e.into()
    })
}

/// Installs the global meter provider the engine's instruments report to.
///
/// Without an OTLP endpoint the metrics are collected but never exported.
///
/// # Errors
///
/// Returns an error if the OTLP metrics exporter fails to build.
pub fn init_metrics(config: &TelemetryConfig) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    let builder = SdkMeterProvider::builder().with_resource(resource());

    let provider = if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "Configuring OTLP metrics exporter");
        let exporter = build_metric_exporter(endpoint, &config.otlp_headers)?;
        let reader = PeriodicReader::builder(exporter).with_interval(Duration::from_secs(5)).build();
        builder.with_reader(reader).build()
    } else {
        tracing::info!("No OTLP endpoint configured, metrics will be collected but not exported");
        builder.build()
    };

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Initializes an OpenTelemetry tracing layer that exports spans via OTLP.
///
/// # Errors
///
/// Returns an error if `otlp_traces_endpoint` is missing or the exporter
/// cannot be constructed.
pub fn init_tracing_with_otlp<S>(
    config: &TelemetryConfig,
) -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>, Box<dyn std::error::Error>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let endpoint = config.otlp_traces_endpoint.as_ref().ok_or_else(|| {
        "Tracing is enabled but no `otlp_traces_endpoint` is configured".to_string()
    })?;

    tracing::info!(endpoint = %endpoint, "Configuring OTLP trace exporter");
    let exporter = build_span_exporter(endpoint, &config.otlp_headers)?;

    let provider =
        SdkTracerProvider::builder().with_batch_exporter(exporter).with_resource(resource()).build();

    let tracer = provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
