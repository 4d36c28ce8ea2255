//! Error types for the research-job engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// The database is locked or busy; safe to retry.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Build a query error from a libSQL failure, classifying lock contention
    /// as [`DatabaseError::Busy`].
    pub fn from_libsql(op: &str, err: libsql::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("database is locked")
            || lower.contains("database is busy")
            || lower.contains("sqlite_busy")
        {
            Self::Busy(format!("{op}: {msg}"))
        } else {
            Self::Query(format!("{op}: {msg}"))
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The agent executable does not exist. Fatal, never retried.
    #[error("Agent executable not found: {program}")]
    ProcessNotFound { program: String },

    /// The OS refused to spawn (or wait on) the agent process.
    #[error("Failed to spawn agent process {program}: {reason}")]
    ProcessSpawnFailure { program: String, reason: String },

    #[error("Job {id} exceeded its deadline of {timeout:?}")]
    JobTimeoutExceeded { id: Uuid, timeout: Duration },

    #[error("Job {id} waited {waited:?} for a free slot")]
    AdmissionQueueTimeoutExceeded { id: Uuid, waited: Duration },

    /// Unknown, already terminal, or already killed.
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Persisting {operation} failed after {attempts} attempts: {reason}")]
    PersistenceWriteFailure {
        operation: String,
        attempts: u32,
        reason: String,
    },
}
