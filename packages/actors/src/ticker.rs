//! Fixed-interval tick delivery to an actor.

use std::time::Duration;

use ractor::{ActorRef, Message};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Send `make()` to `actor` every `period`, starting after `warmup`.
///
/// The task exits on its own once the actor stops accepting messages.
pub(crate) fn spawn_ticker<M, F>(
    actor: ActorRef<M>,
    warmup: Duration,
    period: Duration,
    make: F,
) -> JoinHandle<()>
where
    M: Message,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        if !warmup.is_zero() {
            tokio::time::sleep(warmup).await;
        }

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if actor.send_message(make()).is_err() {
                break;
            }
        }
    })
}
