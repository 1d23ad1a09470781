//! Worker loop: one task per (queue, worker slot).
//!
//! ```text
//! Idle ──token──► claim ──none──► Idle
//!                   │
//!                   ├─ unresolved / undecodable ──► Failed
//!                   └─ dispatch ──► Completed | Failed
//!                                   │ job cancel     ──► Stopped
//!                                   └ shutdown       ──► Failed, loop exits
//! ```
//!
//! A cancelled handler is not dropped: it is awaited for up to the grace
//! period so it can observe the signal and clean up. Only a handler that
//! outlives the grace period is abandoned.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use queue_core::{ErrorInfo, Job, JobId, JobStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{CancelCause, CancellationRegistry, LinkedCancellation};
use crate::channels::AdmissionChannel;
use crate::handler::{JobContext, JobDataSink};
use crate::registry::JobHandlerRegistry;

/// Why a job ended without its handler finishing.
#[derive(Debug, thiserror::Error)]
enum Interrupted {
    #[error("Worker {0} shut down before the job finished")]
    Shutdown(String),
    #[error("Job was cancelled")]
    Cancelled,
}

pub(crate) struct WorkerLoop<S> {
    pub queue: String,
    pub slot: usize,
    pub worker_id: String,
    pub store: Arc<S>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub channel: AdmissionChannel,
    pub shutdown: CancellationToken,
    /// How long a cancelled handler may keep running.
    pub cancel_grace: Duration,
}

impl<S: JobStore> WorkerLoop<S> {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!(queue = %self.queue, slot = self.slot, "Worker started");

        // The job this slot holds, so it can be handed back if the loop dies.
        let held: Mutex<Option<JobId>> = Mutex::new(None);

        while let Err(panic) = AssertUnwindSafe(self.serve(&held)).catch_unwind().await {
            tracing::error!(
                queue = %self.queue,
                slot = self.slot,
                panic = ?panic.downcast_ref::<&str>(),
                "Worker loop panicked"
            );
            self.release_held(&held).await;
            if self.shutdown.is_cancelled() {
                break;
            }
            tracing::warn!(queue = %self.queue, slot = self.slot, "Restarting worker slot");
        }

        tracing::info!(queue = %self.queue, slot = self.slot, "Worker stopped");
    }

    async fn release_held(&self, held: &Mutex<Option<JobId>>) {
        let job_id = held.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(job_id) = job_id {
            match self.store.mark_pending(job_id).await {
                Ok(_) => tracing::info!(%job_id, "Returned job to pending"),
                Err(e) => tracing::error!(%job_id, error = %e, "Failed to return job to pending"),
            }
        }
    }

    async fn serve(&self, held: &Mutex<Option<JobId>>) {
        loop {
            let token = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                token = self.channel.recv() => token,
            };
            if token.is_none() {
                break;
            }

            if self.process_next(held).await.is_break() {
                break;
            }
        }
    }

    async fn process_next(&self, held: &Mutex<Option<JobId>>) -> ControlFlow<()> {
        let job = match self.store.claim_next(&self.queue, &self.worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::trace!(queue = %self.queue, "No pending job for token");
                return ControlFlow::Continue(());
            }
            Err(e) => {
                tracing::error!(queue = %self.queue, error = %e, "Failed to claim job");
                return ControlFlow::Continue(());
            }
        };

        *held.lock().unwrap_or_else(PoisonError::into_inner) = Some(job.id);
        let flow = self.execute(job).await;
        *held.lock().unwrap_or_else(PoisonError::into_inner) = None;
        flow
    }

    async fn execute(&self, job: Job) -> ControlFlow<()> {
        let job_id = job.id;
        tracing::debug!(%job_id, payload_type = %job.payload_type, "Claimed job");

        let resolved = match self.handlers.resolve(&job.payload_type, &job.payload) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Cannot run job");
                self.persist_failed(job_id, ErrorInfo::from_error(&e)).await;
                return ControlFlow::Continue(());
            }
        };

        let registration = self.cancellations.register_scoped(job_id);
        let linked = LinkedCancellation::new(registration.token(), &self.shutdown);
        let sink: Arc<dyn JobDataSink> = self.store.clone();
        let ctx = JobContext::new(job_id, job.queue, linked.token().clone(), sink);

        let mut dispatch = pin!(self.handlers.dispatch(resolved, ctx));
        let finished = tokio::select! {
            biased;
            result = &mut dispatch => Some(result),
            _ = linked.token().cancelled() => None,
        };

        // The handler holds the same token; let it observe the cancellation
        // and wind down before its outcome is classified.
        let outcome = match finished {
            Some(result) => Some(result),
            None => match tokio::time::timeout(self.cancel_grace, &mut dispatch).await {
                Ok(result) => Some(result),
                Err(_) => {
                    tracing::warn!(
                        %job_id,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "Handler ignored cancellation; abandoning it"
                    );
                    None
                }
            },
        };

        match (outcome, linked.cause()) {
            (Some(Ok(output)), _) => {
                let data = output.map(|value| value.to_string());
                self.persist(job_id, "completed", self.store.mark_completed(job_id, data))
                    .await;
                ControlFlow::Continue(())
            }
            (_, Some(CancelCause::Shutdown)) => {
                let err = Interrupted::Shutdown(self.worker_id.clone());
                self.persist_failed(job_id, ErrorInfo::from_error(&err)).await;
                ControlFlow::Break(())
            }
            (_, Some(CancelCause::Job)) => {
                self.persist(job_id, "stopped", self.store.mark_stopped(job_id))
                    .await;
                ControlFlow::Continue(())
            }
            (Some(Err(e)), None) => {
                tracing::debug!(%job_id, error = %e, "Handler failed");
                self.persist_failed(job_id, ErrorInfo::from_error(&e)).await;
                ControlFlow::Continue(())
            }
            (None, None) => {
                self.persist_failed(job_id, ErrorInfo::from_error(&Interrupted::Cancelled))
                    .await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn persist_failed(&self, job_id: JobId, error: ErrorInfo) {
        self.persist(job_id, "failed", self.store.mark_failed(job_id, error))
            .await;
    }

    async fn persist(
        &self,
        job_id: JobId,
        outcome: &'static str,
        update: impl Future<Output = Result<bool, queue_core::StoreError>>,
    ) {
        match update.await {
            Ok(true) => tracing::info!(%job_id, outcome, "Job finished"),
            Ok(false) => {
                tracing::warn!(%job_id, outcome, "Job was no longer processing; outcome dropped")
            }
            Err(e) => {
                tracing::error!(%job_id, outcome, error = %e, "Failed to persist job outcome")
            }
        }
    }
}
