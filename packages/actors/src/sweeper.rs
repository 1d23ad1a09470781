//! Stop-request sweeper.
//!
//! `stop` stamps a request on the job record; this actor picks those up and
//! signals the matching local cancellation handle. Requests for jobs running
//! in another process are simply not found in the local registry.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use queue_core::JobStore;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::cancellation::CancellationRegistry;
use crate::messages::SweeperMessage;
use crate::ticker::spawn_ticker;

pub struct SweeperArgs<S> {
    pub store: Arc<S>,
    pub cancellations: Arc<CancellationRegistry>,
    pub interval: Duration,
}

pub struct SweeperState<S> {
    store: Arc<S>,
    cancellations: Arc<CancellationRegistry>,
    ticker: JoinHandle<()>,
}

pub struct StopSweeper<S> {
    _store: PhantomData<fn() -> S>,
}

impl<S> StopSweeper<S> {
    pub fn new() -> Self {
        Self {
            _store: PhantomData,
        }
    }
}

impl<S> Default for StopSweeper<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: JobStore> Actor for StopSweeper<S> {
    type Msg = SweeperMessage;
    type State = SweeperState<S>;
    type Arguments = SweeperArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            interval_ms = args.interval.as_millis() as u64,
            "Starting stop-request sweeper"
        );

        let ticker = spawn_ticker(myself, Duration::ZERO, args.interval, || {
            SweeperMessage::Tick
        });

        Ok(SweeperState {
            store: args.store,
            cancellations: args.cancellations,
            ticker,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SweeperMessage::Tick => match state.store.list_stop_requested().await {
                Ok(ids) => {
                    for job_id in ids {
                        if state.cancellations.request_cancel(job_id) {
                            tracing::debug!(%job_id, "Signalled stop request");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list stop requests");
                }
            },
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker.abort();
        Ok(())
    }
}
