//! HTTP relay: forwards each payload as a JSON POST to a downstream URL.
//!
//! Requests are handed to a single worker task through a bounded queue, so
//! they leave in batch order and a full queue pushes back on `publish`.
//! Delivery is at-most-once: a failed request is logged and dropped.
//!
//! Every request is bracketed by a client span. Its context travels to the
//! downstream service in the W3C `traceparent` header.
use crate::error::{Error, OutputResult};
use crate::record::{RelayEntry, PAYLOAD_ATTRIBUTE};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::HeaderInjector;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracer;
use reqwest::header::HeaderMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Name of the span opened around each relayed request.
pub const RELAY_SPAN_NAME: &str = "relay_event";
/// Span attribute and event field holding the response status.
pub const HTTP_STATUS_CODE_ATTRIBUTE: &str = "http.response.status_code";
/// Name of the span event added once a response arrived.
pub const REQUEST_COMPLETED_EVENT: &str = "request completed";

/// Where and how to relay.
#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Downstream URL receiving the POSTs.
    pub url: String,
    /// Per request timeout.
    pub timeout: Duration,
    /// Capacity of the dispatch queue.
    pub queue_size: usize,
}

enum RelayCommand {
    Forward(RelayEntry),
    Flush(oneshot::Sender<()>),
}

/// Owns the relay worker and the sending side of its queue.
pub(crate) struct RelayDispatcher {
    sender: Mutex<Option<mpsc::Sender<RelayCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RelayDispatcher {
    /// Spawn the worker on the current tokio runtime.
    pub(crate) fn start(settings: RelaySettings, tracer: SdkTracer) -> OutputResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::ExporterInit(format!("relay requires a tokio runtime: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::ExporterInit(e.to_string()))?;
        let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
        let worker = RelayWorker {
            client,
            url: settings.url,
            tracer,
            propagator: TraceContextPropagator::new(),
        };
        let handle = runtime.spawn(worker.run(receiver));
        Ok(RelayDispatcher {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn sender(&self) -> OutputResult<mpsc::Sender<RelayCommand>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::InvariantViolation("relay used after shutdown"))
    }

    /// Queue one request, waiting while the queue is full.
    pub(crate) async fn enqueue(&self, entry: RelayEntry) -> OutputResult<()> {
        self.sender()?
            .send(RelayCommand::Forward(entry))
            .await
            .map_err(|_| Error::InvariantViolation("relay worker stopped"))
    }

    /// Wait until every request queued before this call has completed.
    pub(crate) async fn flush(&self) -> OutputResult<()> {
        let (done, wait) = oneshot::channel();
        self.sender()?
            .send(RelayCommand::Flush(done))
            .await
            .map_err(|_| Error::InvariantViolation("relay worker stopped"))?;
        wait.await
            .map_err(|_| Error::InvariantViolation("relay worker stopped"))
    }

    /// Stop accepting requests and wait, until `deadline`, for the worker to
    /// drain the queue.
    pub(crate) async fn shutdown_by(
        &self,
        deadline: Instant,
        budget: Duration,
    ) -> OutputResult<()> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };
        match tokio::time::timeout_at(deadline, worker).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) => Err(Error::Shutdown(join_error.to_string())),
            Err(_) => Err(Error::ShutdownTimeout(budget)),
        }
    }
}

struct RelayWorker {
    client: reqwest::Client,
    url: String,
    tracer: SdkTracer,
    propagator: TraceContextPropagator,
}

impl RelayWorker {
    async fn run(self, mut receiver: mpsc::Receiver<RelayCommand>) {
        tracing::debug!(name: "RelayWorkerStarted", url = self.url.as_str());
        while let Some(command) = receiver.recv().await {
            match command {
                RelayCommand::Forward(entry) => self.forward(entry).await,
                RelayCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(name: "RelayWorkerStopped", url = self.url.as_str());
    }

    async fn forward(&self, entry: RelayEntry) {
        let span = self
            .tracer
            .span_builder(RELAY_SPAN_NAME)
            .with_kind(SpanKind::Client)
            .with_attributes([
                KeyValue::new("http.request.method", "POST"),
                KeyValue::new("url.full", self.url.clone()),
                KeyValue::new(PAYLOAD_ATTRIBUTE, entry.payload),
            ])
            .start(&self.tracer);
        let cx = Context::current_with_span(span);

        let mut headers = HeaderMap::new();
        self.propagator
            .inject_context(&cx, &mut HeaderInjector(&mut headers));

        let result = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(&entry.body)
            .send()
            .await;

        let span = cx.span();
        match result {
            Ok(response) => {
                let status = i64::from(response.status().as_u16());
                span.set_attribute(KeyValue::new(HTTP_STATUS_CODE_ATTRIBUTE, status));
                span.add_event(
                    REQUEST_COMPLETED_EVENT,
                    vec![KeyValue::new(HTTP_STATUS_CODE_ATTRIBUTE, status)],
                );
                tracing::debug!(name: "RelayRequestCompleted", status = status);
            }
            Err(err) => {
                tracing::warn!(
                    name: "RelayRequestFailed",
                    url = self.url.as_str(),
                    error = %err
                );
                span.set_status(Status::error(err.to_string()));
            }
        }
        span.end();
    }
}
