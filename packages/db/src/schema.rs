//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes. Safe to run on
/// every start.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS key ON job TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON job TYPE string;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string DEFAULT "pending";
DEFINE FIELD IF NOT EXISTS payload ON job TYPE string;
DEFINE FIELD IF NOT EXISTS payload_type ON job TYPE string;
DEFINE FIELD IF NOT EXISTS worker_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS data ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS exception_message ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS exception_stacktrace ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE datetime DEFAULT time::now();
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE datetime DEFAULT time::now();
DEFINE FIELD IF NOT EXISTS stopped_at ON job TYPE option<datetime>;

DEFINE INDEX IF NOT EXISTS job_key ON job FIELDS key UNIQUE;

-- Admission polling and claiming
DEFINE INDEX IF NOT EXISTS job_queue_status ON job FIELDS queue, status;
DEFINE INDEX IF NOT EXISTS job_worker_status ON job FIELDS worker_id, status;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
"#;
