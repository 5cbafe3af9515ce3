use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::progress::{ProgressError, StateError, ValidationError};

/// Top-level error for engine operations.
#[derive(Error, Debug)]
pub enum DocpulseError {
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{0}' already exists")]
    SessionExists(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ProgressError> for DocpulseError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Validation(e) => DocpulseError::Validation(e),
            ProgressError::State(e) => DocpulseError::State(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, DocpulseError>;
