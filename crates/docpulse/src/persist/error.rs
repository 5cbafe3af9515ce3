//! Persistence error types. These never reach observers as session failures;
//! the writer retries, then degrades to in-memory operation.

use std::time::Duration;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database write failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Snapshot serialization failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Durable write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Durable write task failed: {0}")]
    TaskFailed(String),
}
