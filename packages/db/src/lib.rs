//! Storage adapters for the job queue system.
//!
//! This crate provides the [`queue_core::JobStore`] implementations:
//!
//! - [`SurrealJobStore`]: SurrealDB-backed, any engine the `any` connector
//!   understands (`mem://` for tests, `rocksdb://` for persistence)
//! - [`MemoryJobStore`]: process-local store for tests and embedded use
//!
//! # Features
//!
//! - `rocksdb`: Use RocksDB for persistent file-based storage. The in-memory
//!   engine (`mem://`) is always available.

mod connection;
mod memory;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryJobStore;
pub use repositories::SurrealJobStore;
pub use schema::init_schema;

/// Connect, bootstrap the schema and return a ready store.
pub async fn init(config: DbConfig) -> Result<SurrealJobStore, DbError> {
    let db = connect(&config).await?;
    init_schema(&db).await?;
    Ok(SurrealJobStore::new(db))
}
