//! Turning an encoded event payload into the record the active signal emits.
use crate::config::Signal;
use opentelemetry::trace::Event as SpanEvent;
use opentelemetry::KeyValue;
use serde_json::Value;
use std::borrow::Cow;
use std::time::SystemTime;

/// Name of the counter incremented once per event in metrics mode.
pub const EVENT_COUNTER_NAME: &str = "output.events";
/// Attribute carrying the encoded payload on counters and spans.
pub const PAYLOAD_ATTRIBUTE: &str = "event.payload";
/// Name of the span opened per event in traces mode.
pub const PUBLISH_SPAN_NAME: &str = "publish_event";

/// A log record: the payload text observed now, timestamp left to the SDK.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    /// The payload rendered as text.
    pub body: String,
    /// When the output saw the event.
    pub observed_timestamp: SystemTime,
}

/// A counter increment modelling "one event occurred".
#[derive(Clone, Debug, PartialEq)]
pub struct CounterIncrement {
    /// Counter name.
    pub name: &'static str,
    /// Always 1.
    pub delta: u64,
    /// The payload as a single attribute.
    pub attributes: Vec<KeyValue>,
}

/// A span that brackets the emission of one event.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanEntry {
    /// Span name.
    pub name: Cow<'static, str>,
    /// Span attributes, including the payload.
    pub attributes: Vec<KeyValue>,
    /// Span start.
    pub start_time: SystemTime,
    /// Events recorded on the span before it ends.
    pub events: Vec<SpanEvent>,
}

/// A payload to forward over HTTP.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayEntry {
    /// The JSON request body.
    pub body: Value,
    /// The payload as text, tagged on the request span.
    pub payload: String,
}

/// The signal specific shape of one outbound event.
///
/// Built fresh per event and dropped once emitted.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryRecord {
    /// See [`LogEntry`].
    Log(LogEntry),
    /// See [`CounterIncrement`].
    Counter(CounterIncrement),
    /// See [`SpanEntry`].
    Span(SpanEntry),
    /// See [`RelayEntry`].
    Relay(RelayEntry),
}

/// Builds exactly one [`TelemetryRecord`] per payload for a fixed signal.
#[derive(Clone, Copy, Debug)]
pub struct RecordBuilder {
    signal: Signal,
}

impl RecordBuilder {
    /// Create a builder for `signal`.
    pub fn new(signal: Signal) -> Self {
        RecordBuilder { signal }
    }

    /// The signal this builder targets.
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Build the record for an encoded payload.
    pub fn build(&self, payload: &[u8]) -> TelemetryRecord {
        match self.signal {
            Signal::Logs => TelemetryRecord::Log(LogEntry {
                body: payload_text(payload).into_owned(),
                observed_timestamp: SystemTime::now(),
            }),
            Signal::Metrics => TelemetryRecord::Counter(CounterIncrement {
                name: EVENT_COUNTER_NAME,
                delta: 1,
                attributes: vec![KeyValue::new(
                    PAYLOAD_ATTRIBUTE,
                    payload_text(payload).into_owned(),
                )],
            }),
            Signal::Traces => TelemetryRecord::Span(SpanEntry {
                name: Cow::Borrowed(PUBLISH_SPAN_NAME),
                attributes: vec![KeyValue::new(
                    PAYLOAD_ATTRIBUTE,
                    payload_text(payload).into_owned(),
                )],
                start_time: SystemTime::now(),
                events: Vec::new(),
            }),
            Signal::HttpRelay => TelemetryRecord::Relay(RelayEntry {
                body: serde_json::json!({ "message": payload_value(payload) }),
                payload: payload_text(payload).into_owned(),
            }),
        }
    }
}

fn payload_text(payload: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

// Codecs emit JSON, but anything else is still forwarded as a string.
fn payload_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(payload_text(payload).into_owned()))
}
