//! Durable persistence: the batched snapshot writer and the restart
//! recovery loader.

pub mod error;
pub mod recovery;
pub mod writer;

pub use error::PersistenceError;
pub use recovery::{load_and_recover, RecoveryReport};
pub use writer::BatchedWriter;
