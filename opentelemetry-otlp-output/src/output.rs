//! The contract the host's output framework drives, and registration by name.
use crate::client::{ExportClient, PublishOutcome};
use crate::config::OtlpOutputConfig;
use crate::error::{Error, OutputResult};
use crate::publisher::{Batch, Codec, Observer};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Name the OTLP output registers under.
pub const OUTPUT_NAME: &str = "otlp";

/// The four operations an output client offers its host.
pub trait OutputClient: Display + Send + Sync {
    /// Establish the export pipeline.
    fn connect(&self) -> impl Future<Output = OutputResult<()>> + Send;

    /// Export a batch and resolve it.
    fn publish<B: Batch>(
        &self,
        batch: B,
    ) -> impl Future<Output = OutputResult<PublishOutcome>> + Send;

    /// Flush and release the export pipeline.
    fn close(&self) -> impl Future<Output = OutputResult<()>> + Send;
}

impl OutputClient for ExportClient {
    fn connect(&self) -> impl Future<Output = OutputResult<()>> + Send {
        ExportClient::connect(self)
    }

    fn publish<B: Batch>(
        &self,
        batch: B,
    ) -> impl Future<Output = OutputResult<PublishOutcome>> + Send {
        ExportClient::publish(self, batch)
    }

    fn close(&self) -> impl Future<Output = OutputResult<()>> + Send {
        ExportClient::close(self)
    }
}

/// A configured client plus the delivery parameters the host applies to it.
#[derive(Debug)]
pub struct OutputGroup {
    /// Maximum events per batch handed to `publish`.
    pub batch_size: usize,
    /// Redelivery attempts, `None` for unbounded.
    pub max_retries: Option<u64>,
    /// Pause before a handed back event is redelivered.
    pub retry_interval: Duration,
    /// The unconnected client.
    pub client: ExportClient,
}

/// Builds an [`OutputGroup`] from configuration and host collaborators.
pub type OutputFactory =
    fn(OtlpOutputConfig, Arc<dyn Observer>, Arc<dyn Codec>) -> OutputResult<OutputGroup>;

/// The OTLP output factory: validates `config` and builds an unconnected client.
pub fn make_otlp(
    config: OtlpOutputConfig,
    observer: Arc<dyn Observer>,
    codec: Arc<dyn Codec>,
) -> OutputResult<OutputGroup> {
    tracing::debug!(name: "OtlpOutputInitializing", signal = config.signal.as_str());
    config.validate()?;
    Ok(OutputGroup {
        batch_size: config.bulk_max_size,
        max_retries: config.retry_limit(),
        retry_interval: config.retry_interval,
        client: ExportClient::with_collaborators(config, observer, codec),
    })
}

/// Output factories by name.
#[derive(Clone, Default)]
pub struct OutputRegistry {
    factories: HashMap<String, OutputFactory>,
}

impl Debug for OutputRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl OutputRegistry {
    /// A registry holding the OTLP output.
    pub fn with_defaults() -> Self {
        let mut registry = OutputRegistry::default();
        registry.register(OUTPUT_NAME, make_otlp);
        registry
    }

    /// Associate `name` with `factory`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: OutputFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// The factory registered as `name`.
    pub fn lookup(&self, name: &str) -> Option<OutputFactory> {
        self.factories.get(name).copied()
    }

    /// Build the output registered as `name`.
    pub fn build(
        &self,
        name: &str,
        config: OtlpOutputConfig,
        observer: Arc<dyn Observer>,
        codec: Arc<dyn Codec>,
    ) -> OutputResult<OutputGroup> {
        let factory = self
            .lookup(name)
            .ok_or_else(|| Error::invalid_config("output", format!("unknown output '{name}'")))?;
        factory(config, observer, codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{JsonMessageCodec, NoopObserver};

    fn collaborators() -> (Arc<dyn Observer>, Arc<dyn Codec>) {
        (
            Arc::new(NoopObserver),
            Arc::new(JsonMessageCodec::default()),
        )
    }

    #[test]
    fn otlp_is_registered_by_default() {
        let (observer, codec) = collaborators();
        let group = OutputRegistry::with_defaults()
            .build(OUTPUT_NAME, OtlpOutputConfig::default(), observer, codec)
            .unwrap();
        assert_eq!(group.batch_size, 1000);
        assert_eq!(group.max_retries, Some(3));
        assert_eq!(group.retry_interval, Duration::from_secs(60));
        assert_eq!(group.client.to_string(), "otlp(localhost:4317)");
    }

    #[test]
    fn registering_replaces_factory() {
        fn refuse(
            _: OtlpOutputConfig,
            _: Arc<dyn Observer>,
            _: Arc<dyn Codec>,
        ) -> OutputResult<OutputGroup> {
            Err(Error::invalid_config("output", "disabled"))
        }

        let mut registry = OutputRegistry::with_defaults();
        assert!(registry.lookup(OUTPUT_NAME).is_some());
        registry.register(OUTPUT_NAME, refuse);
        let (observer, codec) = collaborators();
        assert!(registry
            .build(OUTPUT_NAME, OtlpOutputConfig::default(), observer, codec)
            .is_err());
    }

    #[test]
    fn unknown_output_is_rejected() {
        let (observer, codec) = collaborators();
        let err = OutputRegistry::with_defaults()
            .build("kafka", OtlpOutputConfig::default(), observer, codec)
            .unwrap_err();
        assert!(err.to_string().contains("kafka"));
    }

    #[test]
    fn invalid_config_fails_the_factory() {
        let (observer, codec) = collaborators();
        let config = OtlpOutputConfig {
            bulk_max_size: 0,
            ..Default::default()
        };
        assert!(make_otlp(config, observer, codec).is_err());
    }

    async fn connect_and_close<C: OutputClient>(client: &C) -> OutputResult<()> {
        client.connect().await?;
        client.close().await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn group_client_is_driven_through_trait() {
        let (observer, codec) = collaborators();
        let group = make_otlp(OtlpOutputConfig::default(), observer, codec).unwrap();
        // the gRPC channel connects lazily, so no collector is needed here
        connect_and_close(&group.client).await.unwrap();
    }

    #[test]
    fn unbounded_retries() {
        let (observer, codec) = collaborators();
        let config = OtlpOutputConfig {
            max_retries: -1,
            ..Default::default()
        };
        assert_eq!(make_otlp(config, observer, codec).unwrap().max_retries, None);
    }
}
