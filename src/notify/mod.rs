//! Prometheus metrics and dead-letter alerting.

pub mod alert;
pub mod metrics;

pub use alert::DeadLetterAlerter;
pub use metrics::{Metrics, MetricsServer};
