//! Building the signal exporter and wrapping it into a [`Provider`].
use crate::config::{OtlpOutputConfig, Signal};
use crate::credentials::{load_credentials, Credentials};
use crate::error::{Error, OutputResult};
use crate::provider::{BatchSettings, Provider};
use crate::relay::RelaySettings;
use opentelemetry_otlp::{
    LogExporter, MetricExporter, SpanExporter, WithExportConfig, WithTonicConfig,
};
use opentelemetry_sdk::Resource;
use std::fmt::Debug;

/// Creates the provider a client emits through.
///
/// [`OtlpProviderFactory`] is the production implementation; tests swap in
/// factories backed by in-memory exporters.
pub trait ProviderFactory: Debug + Send + Sync {
    /// Build a provider for `config.signal`. Called once per client connect.
    fn create(&self, config: &OtlpOutputConfig, resource: Resource) -> OutputResult<Provider>;
}

/// Builds tonic OTLP exporters for the configured signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct OtlpProviderFactory;

impl ProviderFactory for OtlpProviderFactory {
    fn create(&self, config: &OtlpOutputConfig, resource: Resource) -> OutputResult<Provider> {
        let credentials = load_credentials(&config.tls)?;
        let batch = BatchSettings::from_config(config);
        match config.signal {
            Signal::Logs => Ok(Provider::logs(
                build_log_exporter(config, &credentials)?,
                resource,
                &batch,
            )),
            Signal::Metrics => Ok(Provider::metrics(
                build_metric_exporter(config, &credentials)?,
                resource,
            )),
            Signal::Traces => Ok(Provider::traces(
                build_span_exporter(config, &credentials)?,
                resource,
                &batch,
            )),
            Signal::HttpRelay => Provider::relay(
                build_span_exporter(config, &credentials)?,
                resource,
                &batch,
                relay_settings(config)?,
            ),
        }
    }
}

/// Relay settings for a validated [`Signal::HttpRelay`] config.
pub(crate) fn relay_settings(config: &OtlpOutputConfig) -> OutputResult<RelaySettings> {
    let url = config
        .relay_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| Error::invalid_config("relay_url", "required when type is http_relay"))?;
    Ok(RelaySettings {
        url,
        timeout: config.timeout,
        queue_size: config.relay_queue_size,
    })
}

// Every signal shares the endpoint, timeout and TLS wiring.
fn configure<B>(builder: B, config: &OtlpOutputConfig, credentials: &Credentials) -> B
where
    B: WithExportConfig + WithTonicConfig,
{
    let builder = builder
        .with_endpoint(config.endpoint_uri())
        .with_timeout(config.timeout);
    match credentials.tls_config() {
        Some(tls) => builder.with_tls_config(tls.clone()),
        None => builder,
    }
}

/// Build the OTLP/gRPC log exporter.
pub fn build_log_exporter(
    config: &OtlpOutputConfig,
    credentials: &Credentials,
) -> OutputResult<LogExporter> {
    tracing::debug!(name: "LogExporterBuilding", endpoint = config.endpoint.as_str());
    Ok(configure(LogExporter::builder().with_tonic(), config, credentials).build()?)
}

/// Build the OTLP/gRPC metric exporter.
pub fn build_metric_exporter(
    config: &OtlpOutputConfig,
    credentials: &Credentials,
) -> OutputResult<MetricExporter> {
    tracing::debug!(name: "MetricExporterBuilding", endpoint = config.endpoint.as_str());
    Ok(configure(MetricExporter::builder().with_tonic(), config, credentials).build()?)
}

/// Build the OTLP/gRPC span exporter.
pub fn build_span_exporter(
    config: &OtlpOutputConfig,
    credentials: &Credentials,
) -> OutputResult<SpanExporter> {
    tracing::debug!(name: "SpanExporterBuilding", endpoint = config.endpoint.as_str());
    Ok(configure(SpanExporter::builder().with_tonic(), config, credentials).build()?)
}
