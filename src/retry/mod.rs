//! Retry decisions and in-process retry execution.

pub mod middleware;
pub mod policy;

pub use middleware::{ProcessingMiddleware, ProcessingResult};
pub use policy::{ExponentialBackoff, FailureKind, RetryPolicy};
