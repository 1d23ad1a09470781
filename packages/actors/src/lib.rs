//! Scheduling core for the job queue.
//!
//! This crate turns a [`queue_core::JobStore`] into a running job processor:
//! admission control per queue, worker loops that claim and dispatch jobs,
//! and per-job cancellation.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor owning start-up and ordered shutdown
//! - `AdmissionController` - Publishes admission tokens for spare capacity
//! - `StopSweeper` - Signals cancellation for stop requests found in the store
//! - `WorkerLoop` - One task per queue slot; claims, dispatches, persists
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, Scheduler};
//! use queue_core::WorkerConfig;
//!
//! let handlers = JobHandlerRegistry::new();
//! handlers.register::<SendEmail, _>(SendEmailHandler);
//!
//! let config = WorkerConfig::new("host-a").with_queue("default", 4);
//! let scheduler = Scheduler::new(config, store, handlers).start().await?;
//!
//! let job_id = scheduler.queue().submit(&SendEmail { .. }).await?;
//! // ...
//! scheduler.shutdown().await?;
//! ```

mod cancellation;
mod channels;
mod handler;
mod messages;
mod poller;
mod queue;
mod registry;
mod supervisor;
mod sweeper;
mod ticker;
mod worker;

pub use cancellation::{CancelCause, CancellationRegistry, LinkedCancellation, ScopedRegistration};
pub use channels::{AdmissionChannel, AdmissionChannels, AdmissionToken};
pub use handler::{HandlerError, JobContext, JobDataSink, JobHandler, JobPayload, ValueJobHandler};
pub use messages::{PollerMessage, SupervisorMessage, SweeperMessage};
pub use poller::{AdmissionController, PollerArgs, admission_count};
pub use queue::{JobQueue, QueueError};
pub use registry::{DispatchError, JobHandlerRegistry, PayloadKind, ResolvedPayload};
pub use supervisor::{Scheduler, SchedulerError, SchedulerHandle, Supervisor, SupervisorArgs};
pub use sweeper::{StopSweeper, SweeperArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
