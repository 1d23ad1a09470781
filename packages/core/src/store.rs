//! The persistence port the scheduler runs against.
//!
//! Implementations own atomicity: `claim_next` must never hand the same
//! pending job to two concurrent callers. Everything else in the scheduler
//! assumes that guarantee and does not re-check it.

use std::future::Future;

use crate::{ErrorInfo, Job, JobId};

/// Errors surfaced by a store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Record could not be decoded: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent job records with atomic claim and update operations.
///
/// Status-changing operations return `true` when a record actually
/// transitioned. Terminal marks only apply to jobs that are `Processing`.
pub trait JobStore: Send + Sync + 'static {
    /// Create a `Pending` job and return its id.
    fn insert(
        &self,
        queue: &str,
        payload_type: &str,
        payload: String,
    ) -> impl Future<Output = Result<JobId, StoreError>> + Send;

    fn get_by_id(&self, id: JobId) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    fn count_pending(&self, queue: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Jobs in `queue` currently `Processing` under `worker_id`.
    fn count_in_progress(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Atomically move the oldest `Pending` job in `queue` to `Processing`.
    fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    fn mark_completed(
        &self,
        id: JobId,
        data: Option<String>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn mark_failed(
        &self,
        id: JobId,
        error: ErrorInfo,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Reset to `Pending`, clearing worker, data, failure and stop fields.
    fn mark_pending(&self, id: JobId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn mark_stopped(&self, id: JobId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Reset every `Processing` job owned by `worker_id` to `Pending`.
    fn reclaim_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Ids of `Processing` jobs that carry a stop request.
    fn list_stop_requested(&self) -> impl Future<Output = Result<Vec<JobId>, StoreError>> + Send;

    /// Stamp a stop request on a `Processing` job. False when the job is not running.
    fn request_stop(&self, id: JobId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Overwrite a job's data. False when the job does not exist.
    fn set_data(
        &self,
        id: JobId,
        data: Option<String>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
