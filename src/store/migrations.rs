//! Version-tracked database migrations for the libSQL backend.
//!
//! Versions are recorded in `_migrations`; only steps newer than the highest
//! recorded version run.

use libsql::Connection;

use tracing::{debug, info};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                exit_reason TEXT,
                options TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_entity ON jobs(entity_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS job_logs (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_name TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (job_id, seq)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "job_recovery",
        sql: r#"
            ALTER TABLE jobs ADD COLUMN instance_id TEXT NOT NULL DEFAULT '';
            ALTER TABLE jobs ADD COLUMN stuck INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_jobs_stuck ON jobs(stuck);
            CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_at);
        "#,
    },
];

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn migration_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Migration(format!("{op}: {e}"))
}

/// Apply every migration newer than the recorded schema version. Each step
/// and its version record commit in one transaction.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(CREATE_MIGRATIONS_TABLE, ())
        .await
        .map_err(migration_err("create _migrations"))?;

    let applied = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, name = step.name, "Applying migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} ({}) failed: {e}",
                step.version, step.name
            )));
        }
    }

    let to = current_version(conn).await?;
    info!(from = applied, to = to, "Database schema migrated");
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(migration_err("query schema version"))?;
    match rows.next().await.map_err(migration_err("read schema version"))? {
        Some(row) => row.get::<i64>(0).map_err(migration_err("parse schema version")),
        None => Ok(0),
    }
}
