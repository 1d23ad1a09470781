use db::{DbConfig, DbError, SurrealJobStore};

/// Open a fresh in-memory database. Each `mem://` connection is isolated.
pub async fn setup_store() -> Result<SurrealJobStore, DbError> {
    db::init(DbConfig::memory()).await
}
