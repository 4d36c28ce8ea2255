//! Persistence layer: libSQL-backed job records and buffered job logs.

pub mod libsql_backend;
pub mod log_store;
pub mod migrations;
pub mod retry;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use log_store::LogStore;
pub use retry::{RetryPolicy, retry_storage_write};
pub use traits::JobStore;
