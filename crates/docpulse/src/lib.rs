//! docpulse — progress tracking and live streaming for multi-phase document
//! processing pipelines.
//!
//! The pipeline (one producer per session) reports phase- and page-level
//! updates through the ingestion API; the engine maintains one authoritative
//! progress record per session, derives a stable weighted overall
//! percentage, persists snapshots with bounded write frequency, and fans
//! events out to any number of live subscribers with heartbeat and
//! reconnect-by-snapshot semantics.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod persist;
pub mod progress;

pub use broadcast::{EventHub, SessionEvent, Subscription};
pub use config::EngineConfig;
pub use db::{default_database_path, Database, DatabaseError};
pub use engine::{EngineCounts, ProgressEngine};
pub use error::{ConfigError, DocpulseError, Result};
pub use persist::{BatchedWriter, PersistenceError};
pub use progress::{
    ErrorContext, FilePhaseProgress, FileProgress, PhaseSpec, PhaseState, PhaseStatus,
    ProgressError, SessionProgress, SessionStatus, StateError, ValidationError,
};
