//! Progress state: the per-session record, its phase state machine, and the
//! weighted aggregation that derives the overall percentage.

pub mod aggregate;
pub mod error;
pub mod file;
pub mod phase;
pub mod session;

pub use error::{ProgressError, StateError, ValidationError};
pub use file::{FilePhaseProgress, FileProgress};
pub use phase::{PhaseSpec, PhaseState, PhaseStatus};
pub use session::{
    validate_session_id, ErrorContext, PageOutcome, SessionProgress, SessionStatus,
};
