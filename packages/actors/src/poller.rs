//! Admission controller: turns store-observed demand into admission tokens.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{JobStore, StoreError};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::channels::AdmissionChannels;
use crate::messages::PollerMessage;
use crate::ticker::spawn_ticker;

/// Number of tokens to publish for one queue on one tick.
///
/// Spare capacity is the configured worker count minus jobs this process
/// already runs, minus tokens still waiting in the channel. Never more than
/// the pending backlog.
pub fn admission_count(workers: usize, in_progress: u64, pending: u64, queued: usize) -> usize {
    let in_progress = usize::try_from(in_progress).unwrap_or(usize::MAX);
    let pending = usize::try_from(pending).unwrap_or(usize::MAX);
    workers
        .saturating_sub(in_progress)
        .saturating_sub(queued)
        .min(pending)
}

/// Arguments for [`AdmissionController`].
pub struct PollerArgs<S> {
    pub store: Arc<S>,
    pub worker_id: String,
    /// Queue names with their effective worker counts.
    pub queues: Vec<(String, usize)>,
    pub channels: Arc<AdmissionChannels>,
    pub warmup: Duration,
    pub interval: Duration,
}

/// State for the admission controller.
pub struct PollerState<S> {
    store: Arc<S>,
    worker_id: String,
    queues: Vec<(String, usize)>,
    channels: Arc<AdmissionChannels>,
    ticker: JoinHandle<()>,
}

impl<S: JobStore> PollerState<S> {
    async fn admit(&self, queue: &str, workers: usize) -> Result<usize, StoreError> {
        let pending = self.store.count_pending(queue).await?;
        let in_progress = self.store.count_in_progress(queue, &self.worker_id).await?;

        let channel = self.channels.get_or_create(queue);
        let count = admission_count(workers, in_progress, pending, channel.queued());
        let published = channel.publish(count);

        tracing::trace!(
            queue,
            pending,
            in_progress,
            published,
            "Admission tick"
        );
        Ok(published)
    }
}

/// One per process. Ticks on a fixed interval after a warm-up delay.
pub struct AdmissionController<S> {
    _store: PhantomData<fn() -> S>,
}

impl<S> AdmissionController<S> {
    pub fn new() -> Self {
        Self {
            _store: PhantomData,
        }
    }
}

impl<S> Default for AdmissionController<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: JobStore> Actor for AdmissionController<S> {
    type Msg = PollerMessage;
    type State = PollerState<S>;
    type Arguments = PollerArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            worker_id = %args.worker_id,
            queues = args.queues.len(),
            interval_ms = args.interval.as_millis() as u64,
            "Starting admission controller"
        );

        let ticker = spawn_ticker(myself, args.warmup, args.interval, || PollerMessage::Tick);

        Ok(PollerState {
            store: args.store,
            worker_id: args.worker_id,
            queues: args.queues,
            channels: args.channels,
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
            PollerMessage::Tick => {
                for (queue, workers) in &state.queues {
                    match state.admit(queue, *workers).await {
                        Ok(published) if published > 0 => {
                            tracing::debug!(queue = %queue, published, "Published admission tokens");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(queue = %queue, error = %e, "Admission check failed; skipping queue this tick");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker.abort();
        tracing::info!(worker_id = %state.worker_id, "Admission controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_up_to_free_capacity() {
        assert_eq!(admission_count(4, 0, 10, 0), 4);
        assert_eq!(admission_count(4, 3, 10, 0), 1);
        assert_eq!(admission_count(4, 0, 2, 0), 2);
    }

    #[test]
    fn never_negative() {
        assert_eq!(admission_count(2, 5, 10, 0), 0);
        assert_eq!(admission_count(1, 0, 0, 0), 0);
    }

    #[test]
    fn queued_tokens_count_against_capacity() {
        assert_eq!(admission_count(4, 1, 10, 2), 1);
        assert_eq!(admission_count(4, 0, 10, 9), 0);
    }
}
