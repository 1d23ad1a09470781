//! Process-local job store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use queue_core::{ErrorInfo, Job, JobId, JobStatus, JobStore, StoreError};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

struct Entry {
    seq: u64,
    job: Job,
}

/// In-memory [`JobStore`] guarded by a single mutex.
///
/// Every operation runs under the lock, which makes `claim_next` trivially
/// atomic. Jobs are claimed in insertion order.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every stored job, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    fn with_job<T>(&self, id: JobId, f: impl FnOnce(&mut Job) -> T) -> Option<T> {
        let mut inner = self.lock();
        inner.jobs.get_mut(&id).map(|entry| f(&mut entry.job))
    }
}

impl JobStore for MemoryJobStore {
    async fn insert(
        &self,
        queue: &str,
        payload_type: &str,
        payload: String,
    ) -> Result<JobId, StoreError> {
        let job = Job::new(queue, payload_type, payload);
        let id = job.id;
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn count_pending(&self, queue: &str) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|e| e.job.queue == queue && e.job.status == JobStatus::Pending)
            .count() as u64)
    }

    async fn count_in_progress(&self, queue: &str, worker_id: &str) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|e| {
                e.job.queue == queue
                    && e.job.status == JobStatus::Processing
                    && e.job.worker_id.as_deref() == Some(worker_id)
            })
            .count() as u64)
    }

    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let next = inner
            .jobs
            .values_mut()
            .filter(|e| e.job.queue == queue && e.job.status == JobStatus::Pending)
            .min_by_key(|e| (e.job.created_at, e.seq));

        match next {
            Some(entry) => {
                entry
                    .job
                    .claim(worker_id)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(entry.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_completed(&self, id: JobId, data: Option<String>) -> Result<bool, StoreError> {
        Ok(self
            .with_job(id, |job| job.complete(data).is_ok())
            .unwrap_or(false))
    }

    async fn mark_failed(&self, id: JobId, error: ErrorInfo) -> Result<bool, StoreError> {
        Ok(self
            .with_job(id, |job| job.fail(error).is_ok())
            .unwrap_or(false))
    }

    async fn mark_pending(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.with_job(id, |job| job.reset().is_ok()).unwrap_or(false))
    }

    async fn mark_stopped(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.with_job(id, |job| job.stop().is_ok()).unwrap_or(false))
    }

    async fn reclaim_worker_jobs(&self, worker_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for entry in inner.jobs.values_mut() {
            if entry.job.status == JobStatus::Processing
                && entry.job.worker_id.as_deref() == Some(worker_id)
                && entry.job.reset().is_ok()
            {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list_stop_requested(&self) -> Result<Vec<JobId>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|e| e.job.is_stop_requested())
            .map(|e| e.job.id)
            .collect())
    }

    async fn request_stop(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.with_job(id, Job::request_stop).unwrap_or(false))
    }

    async fn set_data(&self, id: JobId, data: Option<String>) -> Result<bool, StoreError> {
        Ok(self.with_job(id, |job| job.set_data(data)).is_some())
    }
}
