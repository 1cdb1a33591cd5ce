//! # OpenTelemetry OTLP output
//!
//! An output adapter for event pipelines: it takes batches of structured events
//! and exports them to an OpenTelemetry collector over OTLP/gRPC, as logs,
//! metrics or traces. A fourth mode relays each event as a traced HTTP POST to
//! a downstream service.
//!
//! The host drives an [`ExportClient`] through four operations:
//!
//! - `connect` loads TLS credentials, builds the signal exporter and wraps it in
//!   a [`Provider`] with SDK batching and the service [`Resource`].
//! - `publish` encodes every event with the host [`Codec`], turns the payload
//!   into a [`TelemetryRecord`] and emits it. Events that fail go back to the
//!   batch for redelivery; otherwise the batch is acknowledged.
//! - `close` flushes and releases the exporter, bounded by a timeout.
//! - `Display` renders `otlp(<endpoint>)`.
//!
//! Acknowledging a batch means its events were accepted into the export
//! pipeline, not that the collector confirmed them.
//!
//! ## Example
//!
//! ```no_run
//! use opentelemetry_otlp_output::{ExportClient, OtlpOutputConfig, Signal};
//!
//! # async fn run() -> Result<(), opentelemetry_otlp_output::Error> {
//! let config = OtlpOutputConfig {
//!     endpoint: "collector:4317".into(),
//!     signal: Signal::Logs,
//!     ..Default::default()
//! }
//! .with_env_overrides();
//! config.validate()?;
//!
//! let client = ExportClient::new(config);
//! client.connect().await?;
//! // client.publish(batch).await? for every batch the pipeline produces
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Resource`]: opentelemetry_sdk::Resource
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod client;
mod config;
mod credentials;
mod error;
mod exporter;
mod output;
mod provider;
mod publisher;
mod record;
mod relay;

pub use crate::client::{ExportClient, PublishOutcome};
pub use crate::config::{
    OtlpOutputConfig, Signal, TlsSettings, DEFAULT_ENDPOINT, DEFAULT_ENVIRONMENT,
    DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_VERSION, OTEL_EXPORTER_OTLP_ENDPOINT,
    OTEL_EXPORTER_OTLP_TIMEOUT, OTEL_SERVICE_NAME,
};
pub use crate::credentials::{load_credentials, Credentials};
pub use crate::error::{Error, OutputResult};
pub use crate::exporter::{
    build_log_exporter, build_metric_exporter, build_span_exporter, OtlpProviderFactory,
    ProviderFactory,
};
pub use crate::output::{
    make_otlp, OutputClient, OutputFactory, OutputGroup, OutputRegistry, OUTPUT_NAME,
};
pub use crate::provider::{
    build_resource, BatchSettings, Dispatch, Provider, ProviderRegistry, ENVIRONMENT_ATTRIBUTE,
    FALLBACK_SERVICE_NAME, FALLBACK_SERVICE_VERSION, SCOPE_NAME,
};
pub use crate::publisher::{
    Batch, Codec, EncodeError, Event, JsonMessageCodec, NoopObserver, Observer,
};
pub use crate::record::{
    CounterIncrement, LogEntry, RecordBuilder, RelayEntry, SpanEntry, TelemetryRecord,
    EVENT_COUNTER_NAME, PAYLOAD_ATTRIBUTE, PUBLISH_SPAN_NAME,
};
pub use crate::relay::{
    RelaySettings, HTTP_STATUS_CODE_ATTRIBUTE, RELAY_SPAN_NAME, REQUEST_COMPLETED_EVENT,
};
