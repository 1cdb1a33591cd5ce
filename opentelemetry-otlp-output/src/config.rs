//! Configuration for the OTLP output.
//!
//! [`OtlpOutputConfig`] is what the host hands over after unpacking its own
//! configuration document. Missing fields fall back to the defaults below, and
//! a small set of the standard OTLP environment variables can be layered on top
//! with [`OtlpOutputConfig::with_env_overrides`].
use crate::error::{Error, OutputResult};
use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Target to which the output is going to send signals.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Max waiting time for the collector to process each batch, in milliseconds.
pub const OTEL_EXPORTER_OTLP_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
/// Overrides the configured `service.name`.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

/// Default collector address.
pub const DEFAULT_ENDPOINT: &str = "localhost:4317";
/// Default `service.name` used by the output configuration.
pub const DEFAULT_SERVICE_NAME: &str = "sys-devices-vunet";
/// Default `service.version` used by the output configuration.
pub const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
/// Default deployment environment attached to the resource.
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// Telemetry category a client exports. Exactly one is active per client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Every event becomes a log record.
    #[default]
    Logs,
    /// Every event increments a counter.
    Metrics,
    /// Every event becomes a short span.
    Traces,
    /// Every event is POSTed to a downstream URL inside a traced request.
    HttpRelay,
}

impl Signal {
    /// The configuration spelling of this signal.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Logs => "logs",
            Signal::Metrics => "metrics",
            Signal::Traces => "traces",
            Signal::HttpRelay => "http_relay",
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logs" => Ok(Signal::Logs),
            "metrics" => Ok(Signal::Metrics),
            "traces" => Ok(Signal::Traces),
            "http_relay" | "relay" => Ok(Signal::HttpRelay),
            other => Err(Error::invalid_config(
                "type",
                format!("unknown signal type '{other}'"),
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Transport security material for the gRPC channel.
///
/// Every field is a filesystem path except `server_name`, which is the name the
/// collector's certificate is verified against. All empty means plaintext.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file holding the CA certificate(s) that sign the collector certificate.
    #[serde(rename = "tls_credentials")]
    pub ca_certificate: PathBuf,
    /// Domain the collector certificate must be valid for.
    #[serde(rename = "tls_server_url")]
    pub server_name: String,
    /// PEM client certificate for mutual TLS.
    #[serde(rename = "tls_client_certificate")]
    pub client_certificate: PathBuf,
    /// PEM private key matching `client_certificate`.
    #[serde(rename = "tls_client_key")]
    pub client_key: PathBuf,
}

impl TlsSettings {
    /// True when no transport security was requested.
    pub fn is_plaintext(&self) -> bool {
        self.ca_certificate.as_os_str().is_empty()
            && self.client_certificate.as_os_str().is_empty()
            && self.client_key.as_os_str().is_empty()
    }
}

/// Configuration of one OTLP output client. Immutable once the client is built.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct OtlpOutputConfig {
    /// `service.name` resource attribute.
    pub service_name: String,
    /// `service.version` resource attribute.
    pub service_version: String,
    /// `environment` resource attribute.
    pub environment: String,
    /// Collector address, `host:port` or a full URI.
    #[serde(alias = "oltp_endpoint", alias = "otlp_endpoint")]
    pub endpoint: String,
    /// Which signal this client exports.
    #[serde(rename = "type")]
    pub signal: Signal,
    /// Transport security.
    #[serde(flatten)]
    pub tls: TlsSettings,
    /// Delay between redelivery attempts, owned by the host queue.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub retry_interval: Duration,
    /// Export timeout towards the collector.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,
    /// Upper bound on events per batch and per export request.
    pub bulk_max_size: usize,
    /// Redelivery attempts granted by the host, `-1` for unbounded.
    pub max_retries: i64,
    /// Downstream URL for [`Signal::HttpRelay`].
    pub relay_url: Option<String>,
    /// Capacity of the relay dispatch queue.
    pub relay_queue_size: usize,
    /// Upper bound on flush and shutdown.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub flush_timeout: Duration,
}

impl Default for OtlpOutputConfig {
    fn default() -> Self {
        OtlpOutputConfig {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            signal: Signal::Logs,
            tls: TlsSettings::default(),
            retry_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            bulk_max_size: 1000,
            max_retries: 3,
            relay_url: None,
            relay_queue_size: 1024,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

fn deserialize_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

impl OtlpOutputConfig {
    /// Parse a JSON configuration document, completing it with defaults.
    pub fn from_json(document: &str) -> OutputResult<Self> {
        serde_json::from_str(document).map_err(|e| Error::invalid_config("config", e.to_string()))
    }

    /// Apply the standard OTLP environment variables on top of this config.
    ///
    /// Values that cannot be parsed are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(endpoint) = std::env::var(OTEL_EXPORTER_OTLP_ENDPOINT)
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            self.endpoint = endpoint;
        }
        if let Some(timeout) = std::env::var(OTEL_EXPORTER_OTLP_TIMEOUT)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.timeout = Duration::from_millis(timeout);
        }
        if let Some(name) = std::env::var(OTEL_SERVICE_NAME)
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            self.service_name = name;
        }
        self
    }

    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> OutputResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::invalid_config("endpoint", "must not be empty"));
        }
        if self.bulk_max_size == 0 {
            return Err(Error::invalid_config("bulk_max_size", "must be positive"));
        }
        if self.max_retries < -1 {
            return Err(Error::invalid_config(
                "max_retries",
                "must be -1 (unbounded) or a non-negative count",
            ));
        }
        if self.flush_timeout.is_zero() {
            return Err(Error::invalid_config("flush_timeout", "must be positive"));
        }
        if self.signal == Signal::HttpRelay {
            match self.relay_url.as_deref() {
                Some(url) if !url.trim().is_empty() => {}
                _ => {
                    return Err(Error::invalid_config(
                        "relay_url",
                        "required when type is http_relay",
                    ))
                }
            }
            if self.relay_queue_size == 0 {
                return Err(Error::invalid_config("relay_queue_size", "must be positive"));
            }
        }
        let has_cert = !self.tls.client_certificate.as_os_str().is_empty();
        let has_key = !self.tls.client_key.as_os_str().is_empty();
        if has_cert != has_key {
            return Err(Error::invalid_config(
                "tls_client_certificate",
                "client certificate and client key must be configured together",
            ));
        }
        Ok(())
    }

    /// The endpoint as a URI tonic can dial.
    ///
    /// A bare `host:port` gets `https://` when a CA certificate is configured
    /// and `http://` otherwise.
    pub fn endpoint_uri(&self) -> String {
        let endpoint = self.endpoint.trim();
        if endpoint.contains("://") {
            endpoint.to_string()
        } else if self.tls.is_plaintext() {
            format!("http://{endpoint}")
        } else {
            format!("https://{endpoint}")
        }
    }

    /// Redelivery attempts in the host's encoding: `None` means unbounded.
    pub fn retry_limit(&self) -> Option<u64> {
        u64::try_from(self.max_retries).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_env_test<T, F>(env_vars: T, f: F)
    where
        F: FnOnce(),
        T: Into<Vec<(&'static str, &'static str)>>,
    {
        temp_env::with_vars(
            env_vars
                .into()
                .iter()
                .map(|&(k, v)| (k, Some(v)))
                .collect::<Vec<(&'static str, Option<&'static str>)>>(),
            f,
        )
    }

    #[test]
    fn defaults_match_reference_output() {
        let config = OtlpOutputConfig::default();
        assert_eq!(config.service_name, "sys-devices-vunet");
        assert_eq!(config.service_version, "1.0.0");
        assert_eq!(config.endpoint, "localhost:4317");
        assert_eq!(config.signal, Signal::Logs);
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.bulk_max_size, 1000);
        assert_eq!(config.max_retries, 3);
        assert!(config.tls.is_plaintext());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_document_is_completed_with_defaults() {
        let config = OtlpOutputConfig::from_json(
            r#"{
                "oltp_endpoint": "collector:4317",
                "type": "traces",
                "timeout": 30,
                "tls_credentials": "/etc/otel/ca.pem",
                "tls_server_url": "collector.internal"
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "collector:4317");
        assert_eq!(config.signal, Signal::Traces);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.tls.ca_certificate, PathBuf::from("/etc/otel/ca.pem"));
        assert_eq!(config.tls.server_name, "collector.internal");
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.endpoint_uri(), "https://collector:4317");
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let err = OtlpOutputConfig::from_json(r#"{"type": "profiles"}"#).unwrap_err();
        assert!(err.to_string().contains("profiles"));
    }

    #[test]
    fn endpoint_uri_keeps_explicit_scheme() {
        let config = OtlpOutputConfig {
            endpoint: "http://localhost:1234".into(),
            ..Default::default()
        };
        assert_eq!(config.endpoint_uri(), "http://localhost:1234");
        assert_eq!(OtlpOutputConfig::default().endpoint_uri(), "http://localhost:4317");
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let relay_without_url = OtlpOutputConfig {
            signal: Signal::HttpRelay,
            ..Default::default()
        };
        assert!(matches!(
            relay_without_url.validate(),
            Err(Error::InvalidConfig { ref name, .. }) if name == "relay_url"
        ));

        let bad_retries = OtlpOutputConfig {
            max_retries: -2,
            ..Default::default()
        };
        assert!(bad_retries.validate().is_err());

        let half_identity = OtlpOutputConfig {
            tls: TlsSettings {
                client_certificate: "/etc/otel/client.pem".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(half_identity.validate().is_err());

        let zero_batch = OtlpOutputConfig {
            bulk_max_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());
    }

    #[test]
    fn retry_limit_maps_negative_to_unbounded() {
        let unbounded = OtlpOutputConfig {
            max_retries: -1,
            ..Default::default()
        };
        assert_eq!(unbounded.retry_limit(), None);
        assert_eq!(OtlpOutputConfig::default().retry_limit(), Some(3));
    }

    #[test]
    fn env_overrides_apply() {
        run_env_test(
            vec![
                (OTEL_EXPORTER_OTLP_ENDPOINT, "http://otel:4317"),
                (OTEL_EXPORTER_OTLP_TIMEOUT, "2500"),
                (OTEL_SERVICE_NAME, "edge-agent"),
            ],
            || {
                let config = OtlpOutputConfig::default().with_env_overrides();
                assert_eq!(config.endpoint, "http://otel:4317");
                assert_eq!(config.timeout, Duration::from_millis(2500));
                assert_eq!(config.service_name, "edge-agent");
            },
        );
    }

    #[test]
    fn unparseable_env_timeout_is_ignored() {
        run_env_test(vec![(OTEL_EXPORTER_OTLP_TIMEOUT, "soon")], || {
            let config = OtlpOutputConfig::default().with_env_overrides();
            assert_eq!(config.timeout, Duration::from_secs(300));
        });
    }
}
