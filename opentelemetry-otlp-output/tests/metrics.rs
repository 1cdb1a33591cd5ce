//! The metrics signal driven through the export client.
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp_output::{
    Batch, Event, ExportClient, OtlpOutputConfig, OutputResult, Provider, ProviderFactory,
    Signal, EVENT_COUNTER_NAME, PAYLOAD_ATTRIBUTE,
};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::Resource;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct InMemoryMetrics(InMemoryMetricExporter);

impl ProviderFactory for InMemoryMetrics {
    fn create(&self, _: &OtlpOutputConfig, resource: Resource) -> OutputResult<Provider> {
        Ok(Provider::metrics(self.0.clone(), resource))
    }
}

struct AckOnly {
    events: Vec<Event>,
    acked: Arc<AtomicBool>,
}

impl Batch for AckOnly {
    fn events(&self) -> &[Event] {
        &self.events
    }

    fn ack(self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    fn retry_events(self, events: Vec<Event>) {
        panic!("unexpected retry of {} events", events.len());
    }
}

/// Counter sums keyed by the payload attribute.
fn counts_by_payload(exporter: &InMemoryMetricExporter) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    let exported = exporter.get_finished_metrics().unwrap();
    let Some(last) = exported.last() else {
        return counts;
    };
    for scope_metrics in last.scope_metrics() {
        for metric in scope_metrics.metrics() {
            if metric.name() != EVENT_COUNTER_NAME {
                continue;
            }
            if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                for point in sum.data_points() {
                    let payload = point
                        .attributes()
                        .find(|kv| kv.key.as_str() == PAYLOAD_ATTRIBUTE)
                        .map(|kv: &KeyValue| match &kv.value {
                            Value::String(s) => s.as_str().to_string(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default();
                    *counts.entry(payload).or_default() += point.value();
                }
            }
        }
    }
    counts
}

#[tokio::test(flavor = "multi_thread")]
async fn every_event_increments_counter_with_its_payload() {
    let exporter = InMemoryMetricExporter::default();
    let client = ExportClient::new(OtlpOutputConfig {
        signal: Signal::Metrics,
        ..Default::default()
    })
    .with_factory(Arc::new(InMemoryMetrics(exporter.clone())));
    client.connect().await.unwrap();

    let acked = Arc::new(AtomicBool::new(false));
    let events = ["disk full", "disk full", "fan failure"]
        .iter()
        .map(|m| Event::new(json!({ "message": m })))
        .collect();
    let outcome = client
        .publish(AckOnly {
            events,
            acked: acked.clone(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.emitted, 3);
    assert!(acked.load(Ordering::SeqCst));

    client.flush().await.unwrap();
    let counts = counts_by_payload(&exporter);
    assert_eq!(counts.values().sum::<u64>(), 3);
    assert_eq!(counts.get(r#""disk full""#), Some(&2));
    assert_eq!(counts.get(r#""fan failure""#), Some(&1));

    client.close().await.unwrap();
}
