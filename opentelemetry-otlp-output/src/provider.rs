//! The provider owned by a connected client.
//!
//! A [`Provider`] couples one signal exporter with the SDK's background
//! batching (batch processors for logs and spans, a periodic reader for
//! metrics) and the resource describing this service. Records are emitted
//! through it; shutting it down flushes what is buffered and releases the
//! exporter channel.
use crate::config::{OtlpOutputConfig, Signal};
use crate::error::{Error, OutputResult};
use crate::record::{TelemetryRecord, EVENT_COUNTER_NAME};
use crate::relay::{RelayDispatcher, RelaySettings};
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _};
use opentelemetry::metrics::{Counter, MeterProvider as _};
use opentelemetry::trace::{Span as _, Tracer as _, TracerProvider as _};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::logs::{
    BatchConfigBuilder as LogBatchConfigBuilder, BatchLogProcessor, LogExporter, SdkLogger,
    SdkLoggerProvider,
};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder as SpanBatchConfigBuilder, BatchSpanProcessor, SdkTracer,
    SdkTracerProvider, SpanExporter,
};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Fallback `service.name` when the configured one is empty.
pub const FALLBACK_SERVICE_NAME: &str = "unnamed-service";
/// Fallback `service.version` when the configured one is empty.
pub const FALLBACK_SERVICE_VERSION: &str = "0.1.0";
/// Resource attribute holding the deployment environment.
pub const ENVIRONMENT_ATTRIBUTE: &str = "environment";
/// Instrumentation scope of everything this output emits.
pub const SCOPE_NAME: &str = "opentelemetry-otlp-output";

const MIN_QUEUE_SIZE: usize = 2_048;

/// Build the resource descriptor: SDK defaults merged with the service identity.
///
/// Empty service name or version fall back to [`FALLBACK_SERVICE_NAME`] and
/// [`FALLBACK_SERVICE_VERSION`].
pub fn build_resource(config: &OtlpOutputConfig) -> Resource {
    let service_name = if config.service_name.trim().is_empty() {
        tracing::info!(
            name: "ServiceNameDefaulted",
            service_name = FALLBACK_SERVICE_NAME
        );
        FALLBACK_SERVICE_NAME.to_string()
    } else {
        config.service_name.clone()
    };
    let service_version = if config.service_version.trim().is_empty() {
        tracing::info!(
            name: "ServiceVersionDefaulted",
            service_version = FALLBACK_SERVICE_VERSION
        );
        FALLBACK_SERVICE_VERSION.to_string()
    } else {
        config.service_version.clone()
    };

    // attributes added last win over the detected defaults
    Resource::builder()
        .with_attributes([
            KeyValue::new(SERVICE_NAME, service_name),
            KeyValue::new(SERVICE_VERSION, service_version),
            KeyValue::new(ENVIRONMENT_ATTRIBUTE, config.environment.clone()),
        ])
        .build()
}

/// Sizing of the SDK batch processors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSettings {
    /// Records per export request.
    pub max_export_batch_size: usize,
    /// Records buffered before new ones are dropped by the SDK.
    pub max_queue_size: usize,
}

impl BatchSettings {
    /// Derive processor sizing from the output's bulk size.
    pub fn from_config(config: &OtlpOutputConfig) -> Self {
        BatchSettings {
            max_export_batch_size: config.bulk_max_size,
            max_queue_size: config.bulk_max_size.max(MIN_QUEUE_SIZE),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings::from_config(&OtlpOutputConfig::default())
    }
}

/// How a record left [`Provider::emit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the SDK pipeline.
    Emitted,
    /// Queued for the relay worker; not yet sent.
    Enqueued,
}

enum SignalProvider {
    Logs {
        provider: SdkLoggerProvider,
        logger: SdkLogger,
    },
    Metrics {
        provider: SdkMeterProvider,
        counter: Counter<u64>,
    },
    Traces {
        provider: SdkTracerProvider,
        tracer: SdkTracer,
    },
    Relay {
        provider: SdkTracerProvider,
        dispatcher: RelayDispatcher,
    },
}

/// One exporter, its batching worker and the emitter built from them.
pub struct Provider {
    signal: Signal,
    inner: SignalProvider,
}

impl Debug for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("signal", &self.signal)
            .finish()
    }
}

fn scope() -> InstrumentationScope {
    InstrumentationScope::builder(SCOPE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(SCHEMA_URL)
        .build()
}

fn tracer_provider<E: SpanExporter + 'static>(
    exporter: E,
    resource: Resource,
    batch: &BatchSettings,
) -> SdkTracerProvider {
    let processor = BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            SpanBatchConfigBuilder::default()
                .with_max_queue_size(batch.max_queue_size)
                .with_max_export_batch_size(batch.max_export_batch_size)
                .build(),
        )
        .build();
    SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(resource)
        .build()
}

impl Provider {
    /// A logs provider exporting through `exporter`.
    pub fn logs<E: LogExporter + 'static>(
        exporter: E,
        resource: Resource,
        batch: &BatchSettings,
    ) -> Self {
        let processor = BatchLogProcessor::builder(exporter)
            .with_batch_config(
                LogBatchConfigBuilder::default()
                    .with_max_queue_size(batch.max_queue_size)
                    .with_max_export_batch_size(batch.max_export_batch_size)
                    .build(),
            )
            .build();
        let provider = SdkLoggerProvider::builder()
            .with_log_processor(processor)
            .with_resource(resource)
            .build();
        let logger = provider.logger_with_scope(scope());
        Provider {
            signal: Signal::Logs,
            inner: SignalProvider::Logs { provider, logger },
        }
    }

    /// A metrics provider pushing the event counter through `exporter`.
    pub fn metrics<E: PushMetricExporter>(exporter: E, resource: Resource) -> Self {
        let reader = PeriodicReader::builder(exporter).build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build();
        let counter = provider
            .meter_with_scope(scope())
            .u64_counter(EVENT_COUNTER_NAME)
            .with_description("Events accepted by the output")
            .build();
        Provider {
            signal: Signal::Metrics,
            inner: SignalProvider::Metrics { provider, counter },
        }
    }

    /// A traces provider exporting through `exporter`.
    pub fn traces<E: SpanExporter + 'static>(
        exporter: E,
        resource: Resource,
        batch: &BatchSettings,
    ) -> Self {
        let provider = tracer_provider(exporter, resource, batch);
        let tracer = provider.tracer_with_scope(scope());
        Provider {
            signal: Signal::Traces,
            inner: SignalProvider::Traces { provider, tracer },
        }
    }

    /// An HTTP relay whose request spans export through `exporter`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn relay<E: SpanExporter + 'static>(
        exporter: E,
        resource: Resource,
        batch: &BatchSettings,
        settings: RelaySettings,
    ) -> OutputResult<Self> {
        let provider = tracer_provider(exporter, resource, batch);
        let dispatcher = RelayDispatcher::start(settings, provider.tracer_with_scope(scope()))?;
        Ok(Provider {
            signal: Signal::HttpRelay,
            inner: SignalProvider::Relay {
                provider,
                dispatcher,
            },
        })
    }

    /// The signal this provider emits.
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Emit one record. The record must match this provider's signal.
    pub async fn emit(&self, record: TelemetryRecord) -> OutputResult<Dispatch> {
        match (&self.inner, record) {
            (SignalProvider::Logs { logger, .. }, TelemetryRecord::Log(entry)) => {
                let mut log_record = logger.create_log_record();
                log_record.set_observed_timestamp(entry.observed_timestamp);
                log_record.set_body(AnyValue::from(entry.body));
                logger.emit(log_record);
                Ok(Dispatch::Emitted)
            }
            (SignalProvider::Metrics { counter, .. }, TelemetryRecord::Counter(increment)) => {
                counter.add(increment.delta, &increment.attributes);
                Ok(Dispatch::Emitted)
            }
            (SignalProvider::Traces { tracer, .. }, TelemetryRecord::Span(entry)) => {
                let mut span = tracer
                    .span_builder(entry.name)
                    .with_start_time(entry.start_time)
                    .with_attributes(entry.attributes)
                    .start(tracer);
                for event in entry.events {
                    span.add_event_with_timestamp(event.name, event.timestamp, event.attributes);
                }
                span.end();
                Ok(Dispatch::Emitted)
            }
            (SignalProvider::Relay { dispatcher, .. }, TelemetryRecord::Relay(entry)) => {
                dispatcher.enqueue(entry).await?;
                Ok(Dispatch::Enqueued)
            }
            _ => Err(Error::InvariantViolation(
                "record does not match the provider signal",
            )),
        }
    }

    /// Push out everything buffered so far, waiting at most `timeout`.
    pub async fn flush(&self, timeout: Duration) -> OutputResult<()> {
        let deadline = Instant::now() + timeout;
        if let SignalProvider::Relay { dispatcher, .. } = &self.inner {
            tokio::time::timeout_at(deadline, dispatcher.flush())
                .await
                .map_err(|_| Error::ShutdownTimeout(timeout))??;
        }
        let sdk = self.sdk_handle();
        run_bounded(deadline, timeout, move || sdk.force_flush()).await
    }

    /// Flush and release the exporter, waiting at most `timeout`.
    ///
    /// The owner guarantees this runs once.
    pub async fn shutdown(&self, timeout: Duration) -> OutputResult<()> {
        self.shutdown_by(Instant::now() + timeout, timeout).await
    }

    /// Shut down with a deadline shared by every step; `budget` is the bound
    /// reported when it passes.
    pub(crate) async fn shutdown_by(
        &self,
        deadline: Instant,
        budget: Duration,
    ) -> OutputResult<()> {
        if let SignalProvider::Relay { dispatcher, .. } = &self.inner {
            dispatcher.shutdown_by(deadline, budget).await?;
        }
        let sdk = self.sdk_handle();
        run_bounded(deadline, budget, move || sdk.shutdown()).await
    }

    fn sdk_handle(&self) -> SdkHandle {
        match &self.inner {
            SignalProvider::Logs { provider, .. } => SdkHandle::Logs(provider.clone()),
            SignalProvider::Metrics { provider, .. } => SdkHandle::Metrics(provider.clone()),
            SignalProvider::Traces { provider, .. } | SignalProvider::Relay { provider, .. } => {
                SdkHandle::Traces(provider.clone())
            }
        }
    }
}

// Cloned SDK providers share their pipeline, so they can move to a blocking thread.
enum SdkHandle {
    Logs(SdkLoggerProvider),
    Metrics(SdkMeterProvider),
    Traces(SdkTracerProvider),
}

impl SdkHandle {
    fn force_flush(&self) -> OutputResult<()> {
        match self {
            SdkHandle::Logs(provider) => provider.force_flush(),
            SdkHandle::Metrics(provider) => provider.force_flush(),
            SdkHandle::Traces(provider) => provider.force_flush(),
        }
        .map_err(Error::from)
    }

    fn shutdown(&self) -> OutputResult<()> {
        match self {
            SdkHandle::Logs(provider) => provider.shutdown(),
            SdkHandle::Metrics(provider) => provider.shutdown(),
            SdkHandle::Traces(provider) => provider.shutdown(),
        }
        .map_err(Error::from)
    }
}

// SDK flush and shutdown block the calling thread until the batch worker answers.
async fn run_bounded<F>(deadline: Instant, budget: Duration, f: F) -> OutputResult<()>
where
    F: FnOnce() -> OutputResult<()> + Send + 'static,
{
    match tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::Shutdown(join_error.to_string())),
        Err(_) => Err(Error::ShutdownTimeout(budget)),
    }
}

/// Process wide lookup of the active provider per signal.
///
/// Clients opt in with `ExportClient::with_registry`. The last client of a
/// signal to connect owns the entry; closing a client clears the entry only
/// while it still points at that client's provider.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<Signal, Arc<Provider>>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Make `provider` the active one for its signal, returning the one it replaced.
    pub fn register(&self, provider: Arc<Provider>) -> Option<Arc<Provider>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.signal(), provider)
    }

    /// The active provider for `signal`.
    pub fn get(&self, signal: Signal) -> Option<Arc<Provider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .cloned()
    }

    /// Remove `provider` if it is still the active one for its signal.
    pub fn unregister(&self, provider: &Arc<Provider>) -> bool {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match providers.get(&provider.signal()) {
            Some(current) if Arc::ptr_eq(current, provider) => {
                providers.remove(&provider.signal());
                true
            }
            _ => false,
        }
    }
}
