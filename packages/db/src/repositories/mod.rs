//! SurrealDB implementation of the job store.

mod job_store;

pub use job_store::SurrealJobStore;
