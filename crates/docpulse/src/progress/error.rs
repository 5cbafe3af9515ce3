//! Progress state error types.

use thiserror::Error;

use super::phase::PhaseStatus;
use super::session::SessionStatus;

/// A malformed request. Rejected synchronously, no state change.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid session id: {reason}")]
    InvalidSessionId { reason: String },

    #[error("Page {page} out of range for file '{file}' with {total_pages} pages")]
    PageOutOfRange {
        file: String,
        page: u32,
        total_pages: u32,
    },

    #[error("Page count for file '{file}' changed from {previous} to {reported}")]
    PageCountChanged {
        file: String,
        previous: u32,
        reported: u32,
    },

    #[error("Percentage {value} out of range 0-100")]
    PercentageOutOfRange { value: f64 },
}

/// A request that is well-formed but illegal in the session's current state.
/// Rejected synchronously, session state unchanged.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Session is terminal ({status}), no further updates accepted")]
    Terminal { status: SessionStatus },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Phase '{phase}' is not active")]
    PhaseNotActive { phase: String },

    #[error("No phase is active")]
    NoActivePhase,

    #[error("Phase '{phase}' cannot start from status {status}")]
    InvalidTransition {
        phase: String,
        status: PhaseStatus,
    },

    #[error("Phase '{phase}' cannot start: predecessor '{predecessor}' is not completed")]
    PredecessorIncomplete {
        phase: String,
        predecessor: String,
    },

    #[error("Phase '{phase}' does not track files")]
    NotFilePhase { phase: String },

    #[error("File '{file}' is not the current file of phase '{phase}'")]
    FileNotCurrent { file: String, phase: String },

    #[error("Session must declare at least one phase")]
    EmptyPhases,

    #[error("Duplicate phase name '{0}'")]
    DuplicatePhase(String),

    #[error("Phase weights sum to {sum:.6}, expected 1.0")]
    WeightSum { sum: f64 },

    #[error("Phase '{phase}' has invalid weight {weight}")]
    InvalidWeight { phase: String, weight: f64 },
}

/// Any error produced by a state machine operation.
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid state: {0}")]
    State(#[from] StateError),
}
