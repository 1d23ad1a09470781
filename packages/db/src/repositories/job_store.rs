//! SurrealDB-backed job store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use queue_core::{ErrorInfo, Job, JobId, JobStatus, JobStore, StoreError};
use serde::Deserialize;
use surrealdb::sql::Datetime;
use tokio::sync::Mutex;

use crate::{Database, DbError};

/// How many pending candidates a claim attempt walks before giving up.
const CLAIM_CANDIDATES: i64 = 8;

/// Job store persisting to SurrealDB.
///
/// Claims are conditional updates (`WHERE status = "pending"`) on a single
/// record, so two callers can never both move the same job to
/// `processing`. A claim that loses a transaction conflict to another
/// process moves on to the next candidate. Claims issued through one store
/// (and its clones) are additionally serialized to avoid burning candidates
/// on local races.
#[derive(Clone)]
pub struct SurrealJobStore {
    db: Database,
    claim_lock: Arc<Mutex<()>>,
}

/// Internal record type for SurrealDB reads.
#[derive(Debug, Deserialize)]
struct JobRecord {
    key: String,
    queue: String,
    status: JobStatus,
    payload: String,
    payload_type: String,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
    #[serde(default)]
    exception_stacktrace: Option<String>,
    created_at: Datetime,
    updated_at: Datetime,
    #[serde(default)]
    stopped_at: Option<Datetime>,
}

impl JobRecord {
    fn into_job(self) -> Result<Job, DbError> {
        let id = JobId::parse(&self.key)
            .map_err(|e| DbError::Serialization(format!("Invalid job key {}: {}", self.key, e)))?;
        let created_at: DateTime<Utc> = self.created_at.0;
        let updated_at: DateTime<Utc> = self.updated_at.0;
        Ok(Job {
            id,
            queue: self.queue,
            status: self.status,
            payload: self.payload,
            payload_type: self.payload_type,
            worker_id: self.worker_id,
            data: self.data,
            exception_message: self.exception_message,
            exception_stacktrace: self.exception_stacktrace,
            created_at,
            updated_at,
            stopped_at: self.stopped_at.map(|d| d.0),
        })
    }
}

/// Whether a query failed only because a concurrent transaction touched
/// the same record. The claim then counts as lost, not as a store failure.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    let message = err.to_string();
    message.contains("read or write conflict") || message.contains("can be retried")
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

impl SurrealJobStore {
    /// Wrap an open connection. The schema must already be initialized.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Access the underlying connection.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create a new pending job.
    pub async fn create(
        &self,
        queue: &str,
        payload_type: &str,
        payload: String,
    ) -> Result<JobId, DbError> {
        let id = JobId::new();

        let mut response = self
            .db
            .query(
                r#"
                CREATE type::thing("job", $key) CONTENT {
                    key: $key,
                    queue: $queue,
                    status: "pending",
                    payload: $payload,
                    payload_type: $payload_type,
                    created_at: time::now(),
                    updated_at: time::now()
                }
                "#,
            )
            .bind(("key", id.to_string()))
            .bind(("queue", queue.to_string()))
            .bind(("payload", payload))
            .bind(("payload_type", payload_type.to_string()))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        record
            .map(|_| id)
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    /// Count jobs in a queue with the given status, optionally for one worker.
    pub async fn count(
        &self,
        queue: &str,
        status: JobStatus,
        worker_id: Option<&str>,
    ) -> Result<u64, DbError> {
        let query = if worker_id.is_some() {
            r#"
            SELECT count() AS count FROM job
            WHERE queue = $queue AND status = $status AND worker_id = $worker_id
            GROUP ALL
            "#
        } else {
            r#"
            SELECT count() AS count FROM job
            WHERE queue = $queue AND status = $status
            GROUP ALL
            "#
        };

        let mut response = self
            .db
            .query(query)
            .bind(("queue", queue.to_string()))
            .bind(("status", status.as_str()))
            .bind(("worker_id", worker_id.map(str::to_string)))
            .await?;

        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count.max(0) as u64))
    }

    /// Claim the oldest pending job of a queue for `worker_id`.
    pub async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, DbError> {
        let _guard = self.claim_lock.lock().await;

        let mut response = self
            .db
            .query(
                r#"
                SELECT key, created_at FROM job
                WHERE queue = $queue AND status = "pending"
                ORDER BY created_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue", queue.to_string()))
            .bind(("limit", CLAIM_CANDIDATES))
            .await?;
        let candidates: Vec<KeyRow> = response.take(0)?;

        for candidate in candidates {
            match self.try_claim(&candidate.key, worker_id).await {
                Ok(Some(record)) => return record.into_job().map(Some),
                Ok(None) => {}
                // Another process updated the record in the same instant.
                Err(e) if is_write_conflict(&e) => {
                    tracing::debug!(key = %candidate.key, error = %e, "Lost claim race");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Conditionally move one record to processing. `None` when it was no
    /// longer pending.
    async fn try_claim(
        &self,
        key: &str,
        worker_id: &str,
    ) -> Result<Option<JobRecord>, surrealdb::Error> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing("job", $key) SET
                    status = "processing",
                    worker_id = $worker_id,
                    updated_at = time::now()
                WHERE status = "pending"
                RETURN AFTER
                "#,
            )
            .bind(("key", key.to_string()))
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        response.take(0)
    }

    /// Run a single-record update and report whether it matched.
    async fn update_one(
        &self,
        id: JobId,
        query: &'static str,
        bindings: Vec<(&'static str, Option<String>)>,
    ) -> Result<bool, DbError> {
        let mut request = self.db.query(query).bind(("key", id.to_string()));
        for binding in bindings {
            request = request.bind(binding);
        }
        let mut response = request.await?;
        let updated: Vec<JobRecord> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    pub async fn complete(&self, id: JobId, data: Option<String>) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                status = "completed",
                worker_id = NONE,
                data = $data,
                updated_at = time::now()
            WHERE status = "processing"
            RETURN AFTER
            "#,
            vec![("data", data)],
        )
        .await
    }

    pub async fn fail(&self, id: JobId, error: ErrorInfo) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                status = "failed",
                worker_id = NONE,
                exception_message = $message,
                exception_stacktrace = $stacktrace,
                updated_at = time::now()
            WHERE status = "processing"
            RETURN AFTER
            "#,
            vec![
                ("message", Some(error.message)),
                ("stacktrace", Some(error.stacktrace)),
            ],
        )
        .await
    }

    pub async fn stop(&self, id: JobId) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                status = "stopped",
                worker_id = NONE,
                stopped_at = stopped_at ?? time::now(),
                updated_at = time::now()
            WHERE status = "processing"
            RETURN AFTER
            "#,
            Vec::new(),
        )
        .await
    }

    pub async fn reset(&self, id: JobId) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                status = "pending",
                worker_id = NONE,
                data = NONE,
                exception_message = NONE,
                exception_stacktrace = NONE,
                stopped_at = NONE,
                updated_at = time::now()
            RETURN AFTER
            "#,
            Vec::new(),
        )
        .await
    }

    pub async fn request_stop(&self, id: JobId) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                stopped_at = stopped_at ?? time::now(),
                updated_at = time::now()
            WHERE status = "processing"
            RETURN AFTER
            "#,
            Vec::new(),
        )
        .await
    }

    pub async fn update_data(&self, id: JobId, data: Option<String>) -> Result<bool, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing("job", $key) SET
                data = $data,
                updated_at = time::now()
            RETURN AFTER
            "#,
            vec![("data", data)],
        )
        .await
    }

    /// Reset every job `worker_id` still holds back to pending.
    pub async fn reclaim(&self, worker_id: &str) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE job SET
                    status = "pending",
                    worker_id = NONE,
                    data = NONE,
                    exception_message = NONE,
                    exception_stacktrace = NONE,
                    stopped_at = NONE,
                    updated_at = time::now()
                WHERE status = "processing" AND worker_id = $worker_id
                RETURN AFTER
                "#,
            )
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        let reclaimed: Vec<JobRecord> = response.take(0)?;
        Ok(reclaimed.len() as u64)
    }

    /// Keys of running jobs that carry a stop request.
    pub async fn stop_requested(&self) -> Result<Vec<JobId>, DbError> {
        let mut response = self
            .db
            .query(r#"SELECT key FROM job WHERE status = "processing" AND stopped_at != NONE"#)
            .await?;

        let rows: Vec<KeyRow> = response.take(0)?;
        rows.into_iter()
            .map(|row| {
                JobId::parse(&row.key).map_err(|e| {
                    DbError::Serialization(format!("Invalid job key {}: {}", row.key, e))
                })
            })
            .collect()
    }
}

impl JobStore for SurrealJobStore {
    async fn insert(
        &self,
        queue: &str,
        payload_type: &str,
        payload: String,
    ) -> Result<JobId, StoreError> {
        Ok(self.create(queue, payload_type, payload).await?)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.get(id).await?)
    }

    async fn count_pending(&self, queue: &str) -> Result<u64, StoreError> {
        Ok(self.count(queue, JobStatus::Pending, None).await?)
    }

    async fn count_in_progress(&self, queue: &str, worker_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .count(queue, JobStatus::Processing, Some(worker_id))
            .await?)
    }

    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.claim(queue, worker_id).await?)
    }

    async fn mark_completed(&self, id: JobId, data: Option<String>) -> Result<bool, StoreError> {
        Ok(self.complete(id, data).await?)
    }

    async fn mark_failed(&self, id: JobId, error: ErrorInfo) -> Result<bool, StoreError> {
        Ok(self.fail(id, error).await?)
    }

    async fn mark_pending(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.reset(id).await?)
    }

    async fn mark_stopped(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.stop(id).await?)
    }

    async fn reclaim_worker_jobs(&self, worker_id: &str) -> Result<u64, StoreError> {
        Ok(self.reclaim(worker_id).await?)
    }

    async fn list_stop_requested(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(self.stop_requested().await?)
    }

    async fn request_stop(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(SurrealJobStore::request_stop(self, id).await?)
    }

    async fn set_data(&self, id: JobId, data: Option<String>) -> Result<bool, StoreError> {
        Ok(self.update_data(id, data).await?)
    }
}
