//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::NotificationError;

fn prometheus_err(e: prometheus::Error) -> NotificationError {
    NotificationError::PrometheusFailed(e.to_string())
}

/// Prometheus metrics for the delivery pipeline.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Consumed messages by queue and outcome.
    pub messages_total: CounterVec,
    /// Messages waiting in each dead-letter queue.
    pub dead_letter_depth: GaugeVec,
    /// Bulk items by outcome.
    pub bulk_items_total: CounterVec,
    /// Bulk job runs by outcome.
    pub bulk_jobs_total: CounterVec,
    /// Handler latency per queue.
    pub handler_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Creates a new metrics instance with all gauges and counters.
    pub fn new() -> Result<Self, NotificationError> {
        let registry = Registry::new();

        let messages_total = CounterVec::new(
            Opts::new("delivery_messages_total", "Messages consumed, by outcome"),
            &["queue", "outcome"],
        )
        .map_err(prometheus_err)?;

        let dead_letter_depth = GaugeVec::new(
            Opts::new(
                "delivery_dead_letter_depth",
                "Number of messages in each dead-letter queue",
            ),
            &["queue"],
        )
        .map_err(prometheus_err)?;

        let bulk_items_total = CounterVec::new(
            Opts::new("bulk_items_total", "Bulk job items processed, by outcome"),
            &["outcome"],
        )
        .map_err(prometheus_err)?;

        let bulk_jobs_total = CounterVec::new(
            Opts::new("bulk_jobs_total", "Bulk job runs, by outcome"),
            &["outcome"],
        )
        .map_err(prometheus_err)?;

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "delivery_handler_duration_seconds",
                "Time spent in message handlers in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0]),
            &["queue"],
        )
        .map_err(prometheus_err)?;

        // Register all metrics
        registry
            .register(Box::new(messages_total.clone()))
            .map_err(prometheus_err)?;
        registry
            .register(Box::new(dead_letter_depth.clone()))
            .map_err(prometheus_err)?;
        registry
            .register(Box::new(bulk_items_total.clone()))
            .map_err(prometheus_err)?;
        registry
            .register(Box::new(bulk_jobs_total.clone()))
            .map_err(prometheus_err)?;
        registry
            .register(Box::new(handler_duration_seconds.clone()))
            .map_err(prometheus_err)?;

        Ok(Self {
            registry,
            messages_total,
            dead_letter_depth,
            bulk_items_total,
            bulk_jobs_total,
            handler_duration_seconds,
        })
    }

    /// Records one consumed message.
    pub fn record_message(&self, queue: &str, outcome: &str) {
        self.messages_total.with_label_values(&[queue, outcome]).inc();
    }

    pub fn observe_handler_duration(&self, queue: &str, seconds: f64) {
        self.handler_duration_seconds
            .with_label_values(&[queue])
            .observe(seconds);
    }

    /// Updates the dead-letter depth gauge for `queue`.
    pub fn set_dead_letter_depth(&self, queue: &str, depth: u64) {
        self.dead_letter_depth
            .with_label_values(&[queue])
            .set(depth as f64);
    }

    pub fn record_bulk_item(&self, outcome: &str) {
        self.bulk_items_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_bulk_job(&self, outcome: &str) {
        self.bulk_jobs_total.with_label_values(&[outcome]).inc();
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String, NotificationError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(prometheus_err)?;
        String::from_utf8(buffer).map_err(|e| NotificationError::PrometheusFailed(e.to_string()))
    }
}

/// HTTP server for Prometheus metrics.
pub struct MetricsServer {
    /// Metrics instance.
    metrics: Arc<Metrics>,
    /// Port to listen on.
    port: u16,
}

impl MetricsServer {
    /// Creates a new metrics server.
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Serves `/metrics` until `cancel` fires.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), NotificationError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    accepted.map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?
                }
            };

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        let mut response = if req.uri().path() != "/metrics" {
                            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        } else {
                            match metrics.gather() {
                                Ok(body) => Response::new(Full::new(Bytes::from(body))),
                                Err(e) => {
                                    error!(error = %e, "Failed to encode metrics");
                                    let mut response = Response::new(Full::new(Bytes::new()));
                                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                    response
                                }
                            }
                        };
                        response.headers_mut().insert(
                            hyper::header::CONTENT_TYPE,
                            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        Ok::<_, hyper::Error>(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }

        info!("Metrics server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_message("email-notifications", "retried");
        metrics.set_dead_letter_depth("email-notifications-dlq", 4);
        metrics.record_bulk_job("completed");

        let text = metrics.gather().unwrap();
        assert!(text.contains(
            r#"delivery_messages_total{outcome="retried",queue="email-notifications"} 1"#
        ));
        assert!(text.contains(r#"delivery_dead_letter_depth{queue="email-notifications-dlq"} 4"#));
        assert!(text.contains(r#"bulk_jobs_total{outcome="completed"} 1"#));
    }
}
