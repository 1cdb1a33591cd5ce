//! The narrow interfaces the host pipeline supplies: events, batches, the
//! codec that serializes an event and the observer that counts batches.
use serde_json::Value;
use std::fmt::Debug;
use thiserror::Error;

/// One event handed over by the upstream pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event {
    /// The event fields, usually a JSON object.
    pub content: Value,
    /// Optional host metadata, e.g. the target index.
    pub meta: Option<Value>,
}

impl Event {
    /// Create an event from its content.
    pub fn new(content: Value) -> Self {
        Event {
            content,
            meta: None,
        }
    }

    /// Look up a field by dotted path, e.g. `"log.file.path"`.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.content, |value, segment| value.get(segment))
    }

    /// The index the host routes this event to, if it set one.
    pub fn index(&self) -> Option<&str> {
        self.meta.as_ref()?.get("index")?.as_str()
    }
}

/// A unit of work from the pipeline.
///
/// Resolving a batch consumes it, so a batch is either acknowledged or handed
/// back with its failed events, exactly once.
pub trait Batch: Send + Sync {
    /// The events of this batch in pipeline order.
    fn events(&self) -> &[Event];

    /// Every event was accepted into the export pipeline.
    fn ack(self);

    /// Hand back the events that must be redelivered.
    fn retry_events(self, events: Vec<Event>);
}

/// Error returned by a [`Codec`] that cannot serialize an event.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EncodeError {
    /// The field the codec serializes is absent.
    #[error("event has no '{0}' field")]
    MissingField(String),
    /// Serialization itself failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Serializes event content to bytes.
pub trait Codec: Debug + Send + Sync {
    /// Encode `event`, optionally routed to `index`.
    fn encode(&self, index: &str, event: &Event) -> Result<Vec<u8>, EncodeError>;
}

/// Serializes a single field of the event, `message` by default, as JSON.
#[derive(Clone, Debug)]
pub struct JsonMessageCodec {
    field: String,
}

impl Default for JsonMessageCodec {
    fn default() -> Self {
        JsonMessageCodec {
            field: "message".to_string(),
        }
    }
}

impl JsonMessageCodec {
    /// Serialize `field` instead of `message`.
    pub fn with_field(field: impl Into<String>) -> Self {
        JsonMessageCodec {
            field: field.into(),
        }
    }
}

impl Codec for JsonMessageCodec {
    fn encode(&self, _index: &str, event: &Event) -> Result<Vec<u8>, EncodeError> {
        let value = event
            .get_value(&self.field)
            .ok_or_else(|| EncodeError::MissingField(self.field.clone()))?;
        Ok(serde_json::to_vec(value)?)
    }
}

/// Receives batch level counts for the host's own metrics.
pub trait Observer: Debug + Send + Sync {
    /// A batch of `count` events arrived.
    fn new_batch(&self, count: usize);

    /// `count` events were accepted into the export pipeline.
    fn acked(&self, _count: usize) {}

    /// `count` events were handed back for redelivery.
    fn retried(&self, _count: usize) {}
}

/// An [`Observer`] that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn new_batch(&self, _count: usize) {}
}
