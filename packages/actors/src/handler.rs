//! Job payload and handler traits.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use queue_core::{JobId, JobStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// A serializable request body with a stable type tag.
///
/// `PAYLOAD_TYPE` is what gets persisted with the job and later used to find
/// the handler, so it must not change once jobs of this type exist.
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    const PAYLOAD_TYPE: &'static str;
}

/// Handler for a fire-and-forget payload.
pub trait JobHandler<P: JobPayload>: Send + Sync + 'static {
    fn handle(
        &self,
        payload: P,
        ctx: JobContext,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Handler for a payload that produces a result value.
///
/// The output is serialized and stored as the job's data on completion.
pub trait ValueJobHandler<P: JobPayload>: Send + Sync + 'static {
    type Output: Serialize + Send + 'static;

    fn handle(
        &self,
        payload: P,
        ctx: JobContext,
    ) -> impl Future<Output = Result<Self::Output, HandlerError>> + Send;
}

impl<P, F, Fut> JobHandler<P> for F
where
    P: JobPayload,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(
        &self,
        payload: P,
        ctx: JobContext,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self)(payload, ctx)
    }
}

/// Errors a handler may return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler observed its cancellation signal and gave up.
    #[error("Job was cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Where [`JobContext::set_data`] writes progress.
///
/// Every [`JobStore`] is a sink.
pub trait JobDataSink: Send + Sync + 'static {
    fn write_data(
        &self,
        job_id: JobId,
        data: Option<String>,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;
}

impl<S: JobStore> JobDataSink for S {
    fn write_data(
        &self,
        job_id: JobId,
        data: Option<String>,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(self.set_data(job_id, data))
    }
}

/// Per-run context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    queue: String,
    token: CancellationToken,
    sink: Arc<dyn JobDataSink>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        queue: impl Into<String>,
        token: CancellationToken,
        sink: Arc<dyn JobDataSink>,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            token,
            sink,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fires on a stop request for this job or on process shutdown.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Publish progress. Readable through `get_job` while the job still runs,
    /// and overwritten by the result when it completes.
    pub async fn set_data<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), HandlerError> {
        let data = serde_json::to_string(value)?;
        if !self.sink.write_data(self.job_id, Some(data)).await? {
            tracing::warn!(job_id = %self.job_id, "Progress written for a job the store no longer has");
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
