//! The export client: owns the provider and resolves every batch it is given.
use crate::config::OtlpOutputConfig;
use crate::error::{Error, OutputResult};
use crate::exporter::{OtlpProviderFactory, ProviderFactory};
use crate::provider::{build_resource, Dispatch, Provider, ProviderRegistry};
use crate::publisher::{Batch, Codec, Event, JsonMessageCodec, NoopObserver, Observer};
use crate::record::RecordBuilder;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// What happened to the events of one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Events handed to the SDK export pipeline.
    pub emitted: usize,
    /// Events queued for the relay worker but not yet sent.
    pub enqueued: usize,
    /// Events handed back to the batch for redelivery.
    pub retried: usize,
    /// Whether the whole batch was acknowledged.
    pub acked: bool,
}

#[derive(Debug)]
enum ClientState {
    Uninitialized,
    Active(Arc<Provider>),
    Failed,
    ShutDown,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Active(_) => "active",
            ClientState::Failed => "failed",
            ClientState::ShutDown => "shut down",
        }
    }
}

/// Exports pipeline batches through one OTLP provider.
///
/// `connect` and `close` take the lifecycle lock exclusively, so they never
/// overlap a `publish`. A client connects once; after a failed connect or a
/// close it has to be rebuilt.
pub struct ExportClient {
    config: OtlpOutputConfig,
    observer: Arc<dyn Observer>,
    codec: Arc<dyn Codec>,
    factory: Arc<dyn ProviderFactory>,
    registry: Option<Arc<ProviderRegistry>>,
    builder: RecordBuilder,
    state: RwLock<ClientState>,
}

impl Debug for ExportClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportClient")
            .field("endpoint", &self.config.endpoint)
            .field("signal", &self.config.signal)
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl Display for ExportClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "otlp({})", self.config.endpoint)
    }
}

impl ExportClient {
    /// A client using the JSON `message` codec and no observer.
    pub fn new(config: OtlpOutputConfig) -> Self {
        ExportClient::with_collaborators(
            config,
            Arc::new(NoopObserver),
            Arc::new(JsonMessageCodec::default()),
        )
    }

    /// A client using the host's observer and codec.
    pub fn with_collaborators(
        config: OtlpOutputConfig,
        observer: Arc<dyn Observer>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        ExportClient {
            builder: RecordBuilder::new(config.signal),
            config,
            observer,
            codec,
            factory: Arc::new(OtlpProviderFactory),
            registry: None,
            state: RwLock::new(ClientState::Uninitialized),
        }
    }

    /// Build providers with `factory` instead of the OTLP/gRPC one.
    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Publish the provider in `registry` once connected.
    pub fn with_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &OtlpOutputConfig {
        &self.config
    }

    /// Build credentials, exporter and provider, then become active.
    ///
    /// Any failure leaves the client permanently failed.
    pub async fn connect(&self) -> OutputResult<()> {
        let mut state = self.state.write().await;
        if !matches!(*state, ClientState::Uninitialized) {
            tracing::warn!(name: "ConnectRejected", state = state.name());
            return Err(Error::InvariantViolation(
                "connect called on a client that is not uninitialized",
            ));
        }

        tracing::debug!(
            name: "OtlpOutputConnecting",
            endpoint = self.config.endpoint.as_str(),
            signal = self.config.signal.as_str()
        );
        let provider = match self
            .factory
            .create(&self.config, build_resource(&self.config))
        {
            Ok(provider) => Arc::new(provider),
            Err(err) => {
                tracing::error!(
                    name: "OtlpOutputConnectFailed",
                    endpoint = self.config.endpoint.as_str(),
                    error = %err
                );
                *state = ClientState::Failed;
                return Err(Error::Connect(Box::new(err)));
            }
        };

        if let Some(registry) = &self.registry {
            if registry.register(provider.clone()).is_some() {
                tracing::debug!(
                    name: "ProviderReplaced",
                    signal = self.config.signal.as_str()
                );
            }
        }
        *state = ClientState::Active(provider);
        tracing::debug!(
            name: "OtlpOutputConnected",
            endpoint = self.config.endpoint.as_str()
        );
        Ok(())
    }

    /// Export every event of `batch`, then resolve it.
    ///
    /// Events that fail to encode or emit are handed back through
    /// [`Batch::retry_events`]; otherwise the batch is acknowledged. Per event
    /// failures never fail the call. Publishing on a client that is not active
    /// is an [`Error::InvariantViolation`]; the whole batch is handed back.
    pub async fn publish<B: Batch>(&self, batch: B) -> OutputResult<PublishOutcome> {
        let state = self.state.read().await;
        let ClientState::Active(provider) = &*state else {
            tracing::error!(name: "PublishRejected", state = state.name());
            let events = batch.events().to_vec();
            batch.retry_events(events);
            return Err(Error::InvariantViolation(
                "publish called on a client that is not connected",
            ));
        };

        let events = batch.events();
        self.observer.new_batch(events.len());
        tracing::debug!(name: "PublishStarted", count = events.len());

        let mut outcome = PublishOutcome::default();
        let mut retry: Vec<Event> = Vec::new();
        for event in events {
            match self.dispatch(provider, event).await {
                Ok(Dispatch::Emitted) => outcome.emitted += 1,
                Ok(Dispatch::Enqueued) => outcome.enqueued += 1,
                Err(err) => {
                    tracing::warn!(name: "EventDispatchFailed", error = %err);
                    retry.push(event.clone());
                }
            }
        }

        if retry.is_empty() {
            outcome.acked = true;
            self.observer.acked(events.len());
            batch.ack();
        } else {
            outcome.retried = retry.len();
            self.observer.retried(retry.len());
            tracing::debug!(name: "PublishRetrying", count = retry.len());
            batch.retry_events(retry);
        }
        Ok(outcome)
    }

    async fn dispatch(&self, provider: &Provider, event: &Event) -> OutputResult<Dispatch> {
        let payload = self
            .codec
            .encode(event.index().unwrap_or_default(), event)
            .map_err(|e| Error::EventEncoding(e.to_string()))?;
        provider.emit(self.builder.build(&payload)).await
    }

    /// Wait until everything accepted so far has left the provider.
    ///
    /// For the relay this includes the queued requests.
    pub async fn flush(&self) -> OutputResult<()> {
        let state = self.state.read().await;
        match &*state {
            ClientState::Active(provider) => provider.flush(self.config.flush_timeout).await,
            _ => Err(Error::InvariantViolation(
                "flush called on a client that is not connected",
            )),
        }
    }

    /// Flush and release the provider. Calling it again is a no-op.
    ///
    /// Waiting for the lifecycle lock, draining the relay queue and shutting
    /// down the SDK pipeline share one deadline of the configured flush timeout.
    pub async fn close(&self) -> OutputResult<()> {
        let timeout = self.config.flush_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = tokio::time::timeout_at(deadline, self.state.write())
            .await
            .map_err(|_| Error::ShutdownTimeout(timeout))?;
        let provider = match std::mem::replace(&mut *state, ClientState::ShutDown) {
            ClientState::Active(provider) => provider,
            previous @ (ClientState::Uninitialized
            | ClientState::Failed
            | ClientState::ShutDown) => {
                tracing::debug!(name: "OtlpOutputAlreadyClosed", state = previous.name());
                return Ok(());
            }
        };
        drop(state);

        if let Some(registry) = &self.registry {
            registry.unregister(&provider);
        }
        match provider.shutdown_by(deadline, timeout).await {
            Ok(()) => {
                tracing::debug!(
                    name: "OtlpOutputClosed",
                    endpoint = self.config.endpoint.as_str()
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(name: "OtlpOutputShutdownFailed", error = %err);
                Err(err)
            }
        }
    }
}
