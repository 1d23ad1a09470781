//! Supervisor actor owning the scheduler's lifecycle.
//!
//! Start-up spawns the admission controller and stop-request sweeper as
//! linked children plus one worker task per queue slot. Shutdown runs in a
//! fixed order: stop handing out tokens, cancel running jobs, wait for every
//! worker, then return this process's remaining claims to pending.

use std::marker::PhantomData;
use std::sync::Arc;

use queue_core::{JobStore, WorkerConfig};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancellation::CancellationRegistry;
use crate::channels::AdmissionChannels;
use crate::messages::{PollerMessage, SupervisorMessage, SweeperMessage};
use crate::poller::{AdmissionController, PollerArgs};
use crate::queue::JobQueue;
use crate::registry::JobHandlerRegistry;
use crate::sweeper::{StopSweeper, SweeperArgs};
use crate::worker::WorkerLoop;

/// Errors from starting or stopping a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),
    #[error("Supervisor unreachable: {0}")]
    Messaging(String),
    #[error("Supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Shared pieces every component receives.
pub struct SupervisorArgs<S> {
    pub config: WorkerConfig,
    pub store: Arc<S>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub channels: Arc<AdmissionChannels>,
    pub shutdown: CancellationToken,
}

/// State for the supervisor actor.
pub struct SupervisorState<S> {
    args: SupervisorArgs<S>,
    poller: Option<ActorRef<PollerMessage>>,
    sweeper: Option<ActorRef<SweeperMessage>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: JobStore> SupervisorState<S> {
    async fn spawn_poller(&mut self, supervisor: ActorCell) -> Result<(), ActorProcessingErr> {
        let args = PollerArgs {
            store: self.args.store.clone(),
            worker_id: self.args.config.worker_id.clone(),
            queues: self.args.config.queue_workers(),
            channels: self.args.channels.clone(),
            warmup: self.args.config.warmup_delay(),
            interval: self.args.config.polling_interval(),
        };
        let (poller, _) =
            Actor::spawn_linked(None, AdmissionController::<S>::new(), args, supervisor).await?;
        self.poller = Some(poller);
        Ok(())
    }

    async fn spawn_sweeper(&mut self, supervisor: ActorCell) -> Result<(), ActorProcessingErr> {
        let args = SweeperArgs {
            store: self.args.store.clone(),
            cancellations: self.args.cancellations.clone(),
            interval: self.args.config.stop_polling_interval(),
        };
        let (sweeper, _) =
            Actor::spawn_linked(None, StopSweeper::<S>::new(), args, supervisor).await?;
        self.sweeper = Some(sweeper);
        Ok(())
    }

    fn spawn_workers(&mut self) {
        for (queue, workers) in self.args.config.queue_workers() {
            let channel = self.args.channels.get_or_create(&queue);
            for slot in 0..workers {
                let worker = WorkerLoop {
                    queue: queue.clone(),
                    slot,
                    worker_id: self.args.config.worker_id.clone(),
                    store: self.args.store.clone(),
                    handlers: self.args.handlers.clone(),
                    cancellations: self.args.cancellations.clone(),
                    channel: channel.clone(),
                    shutdown: self.args.shutdown.clone(),
                    cancel_grace: self.args.config.cancel_grace_period(),
                };
                self.workers.push(worker.spawn());
            }
        }
    }

    async fn shutdown(&mut self) -> u64 {
        let worker_id = self.args.config.worker_id.clone();
        tracing::info!(%worker_id, "Shutting down scheduler");

        // No new tokens are taken and running handlers see the shutdown.
        self.args.shutdown.cancel();
        self.args.cancellations.cancel_all();
        self.args.channels.close_all();

        if let Some(poller) = self.poller.take() {
            poller.stop(None);
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop(None);
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }

        match self.args.store.reclaim_worker_jobs(&worker_id).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(%worker_id, count, "Returned owned jobs to pending");
                }
                count
            }
            Err(e) => {
                tracing::error!(%worker_id, error = %e, "Failed to reclaim owned jobs");
                0
            }
        }
    }
}

/// Top-level actor of a scheduler instance.
pub struct Supervisor<S> {
    _store: PhantomData<fn() -> S>,
}

impl<S> Supervisor<S> {
    pub fn new() -> Self {
        Self {
            _store: PhantomData,
        }
    }
}

impl<S> Default for Supervisor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: JobStore> Actor for Supervisor<S> {
    type Msg = SupervisorMessage;
    type State = SupervisorState<S>;
    type Arguments = SupervisorArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            worker_id = %args.config.worker_id,
            payload_types = ?args.handlers.payload_types(),
            "Starting scheduler supervisor"
        );

        let mut state = SupervisorState {
            args,
            poller: None,
            sweeper: None,
            workers: Vec::new(),
        };
        state.spawn_poller(myself.get_cell()).await?;
        state.spawn_sweeper(myself.get_cell()).await?;
        state.spawn_workers();

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Shutdown { reply } => {
                let reclaimed = state.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(reclaimed);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, reason) => {
                if state.args.shutdown.is_cancelled() {
                    return Ok(());
                }
                let is_poller = state
                    .poller
                    .as_ref()
                    .is_some_and(|poller| poller.get_id() == cell.get_id());
                let is_sweeper = state
                    .sweeper
                    .as_ref()
                    .is_some_and(|sweeper| sweeper.get_id() == cell.get_id());

                if is_poller {
                    tracing::error!(%reason, "Admission controller failed; restarting");
                    state.spawn_poller(myself.get_cell()).await?;
                } else if is_sweeper {
                    tracing::error!(%reason, "Stop-request sweeper failed; restarting");
                    state.spawn_sweeper(myself.get_cell()).await?;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(actor = ?cell.get_id(), ?reason, "Child actor terminated");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Builds and starts a scheduler for one worker process.
pub struct Scheduler<S> {
    config: WorkerConfig,
    store: Arc<S>,
    handlers: Arc<JobHandlerRegistry>,
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(config: WorkerConfig, store: S, handlers: JobHandlerRegistry) -> Self {
        Self {
            config,
            store: Arc::new(store),
            handlers: Arc::new(handlers),
        }
    }

    /// Spawn the supervisor, its children and every worker slot.
    pub async fn start(self) -> Result<SchedulerHandle<S>, SchedulerError> {
        let cancellations = Arc::new(CancellationRegistry::new());
        let queue = JobQueue::new(
            self.store.clone(),
            cancellations.clone(),
            self.config.restart_poll_interval(),
            self.config.restart_timeout(),
        );
        let worker_id = self.config.worker_id.clone();

        let args = SupervisorArgs {
            config: self.config,
            store: self.store,
            handlers: self.handlers.clone(),
            cancellations,
            channels: Arc::new(AdmissionChannels::new()),
            shutdown: CancellationToken::new(),
        };
        let (supervisor, join) = Actor::spawn(None, Supervisor::<S>::new(), args).await?;

        Ok(SchedulerHandle {
            supervisor,
            join: Some(join),
            queue,
            handlers: self.handlers,
            worker_id,
        })
    }
}

/// A running scheduler.
///
/// Dropping the handle without calling [`SchedulerHandle::shutdown`] still
/// runs the ordered shutdown in the background, but nothing waits for it.
pub struct SchedulerHandle<S> {
    supervisor: ActorRef<SupervisorMessage>,
    join: Option<JoinHandle<()>>,
    queue: JobQueue<S>,
    handlers: Arc<JobHandlerRegistry>,
    worker_id: String,
}

impl<S: JobStore> SchedulerHandle<S> {
    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    /// Registry the workers dispatch through; handlers added here take effect
    /// for the next job claimed.
    pub fn handlers(&self) -> &Arc<JobHandlerRegistry> {
        &self.handlers
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop the scheduler and wait for it. Returns how many claimed jobs were
    /// returned to pending.
    pub async fn shutdown(mut self) -> Result<u64, SchedulerError> {
        let reply = self
            .supervisor
            .call(|reply| SupervisorMessage::Shutdown { reply: Some(reply) }, None)
            .await
            .map_err(|e| SchedulerError::Messaging(e.to_string()))?;

        let reclaimed = match reply {
            CallResult::Success(count) => count,
            CallResult::Timeout => {
                return Err(SchedulerError::Messaging("shutdown timed out".into()));
            }
            CallResult::SenderError => {
                return Err(SchedulerError::Messaging("shutdown reply dropped".into()));
            }
        };

        if let Some(join) = self.join.take() {
            join.await?;
        }
        tracing::info!(worker_id = %self.worker_id, reclaimed, "Scheduler stopped");
        Ok(reclaimed)
    }
}

impl<S> Drop for SchedulerHandle<S> {
    fn drop(&mut self) {
        // Still set once `shutdown` has not completed.
        if self.join.is_some() {
            tracing::warn!(worker_id = %self.worker_id, "Scheduler handle dropped; shutting down in the background");
            let _ = self
                .supervisor
                .cast(SupervisorMessage::Shutdown { reply: None });
        }
    }
}
