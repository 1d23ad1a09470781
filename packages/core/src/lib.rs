//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobId and JobStatus for work items and their state machine
//! - WorkerConfig and QueueConfig for process configuration
//! - The JobStore port implemented by storage adapters

mod job;
mod queue;
mod store;

pub use job::{ErrorInfo, Job, JobId, JobStatus, TransitionError};
pub use queue::{DEFAULT_QUEUE, QueueConfig, WorkerConfig};
pub use store::{JobStore, StoreError};
