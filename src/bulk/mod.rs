//! Bulk jobs: one job fans out into many independently tracked item dispatches.

pub mod control;
pub mod job;
pub mod processor;
pub mod store;

pub use control::JobControl;
pub use job::{BulkItem, BulkJob, BulkJobStatus, ItemChannel, ItemStatus, JobProgress, JobWithItems};
pub use processor::BulkJobProcessor;
pub use store::{InMemoryJobStore, JobRepository, Lease, RedisJobStore};
