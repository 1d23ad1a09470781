//! Message types for actor communication.

use ractor::RpcReplyPort;

/// Messages for the admission controller.
#[derive(Debug)]
pub enum PollerMessage {
    /// Recompute spare capacity for every queue and publish tokens.
    Tick,
}

/// Messages for the stop-request sweeper.
#[derive(Debug)]
pub enum SweeperMessage {
    /// Scan the store for stop requests.
    Tick,
}

/// Messages for the scheduler supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Run the ordered teardown and reply with the number of reclaimed jobs,
    /// if anyone is waiting.
    Shutdown { reply: Option<RpcReplyPort<u64>> },
}
