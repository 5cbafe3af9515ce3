//! Recovery loader: rebuilds in-memory session state from durable snapshots
//! after a process restart.
//!
//! A session that was `pending` or `running` at the last durable write has
//! lost its producer; it is surfaced as `failed` with an `interrupted` error
//! context rather than silently resuming or hanging at a stale percentage.

use std::collections::HashSet;

use crate::db::{session_repo, Database, DatabaseError, SessionRow};
use crate::progress::SessionProgress;

/// Outcome of a startup recovery pass.
pub struct RecoveryReport {
    /// Sessions to seed the in-memory table with, interrupted ones included.
    pub loaded: Vec<SessionProgress>,
    /// How many live sessions were marked interrupted.
    pub interrupted: usize,
}

/// Loads recent sessions from durable storage, marking orphaned live
/// sessions as interrupted and writing the terminal snapshot back.
pub fn load_and_recover(
    db: &Database,
    recent_limit: u64,
) -> Result<RecoveryReport, DatabaseError> {
    let mut loaded: Vec<SessionProgress> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut interrupted = 0;

    for row in session_repo::list_active(db)? {
        let mut session = match row.parse_snapshot() {
            Ok(session) => session,
            Err(e) => {
                log::error!("Skipping unrecoverable session '{}': {}", row.id, e);
                continue;
            }
        };

        if session
            .fail("interrupted", "Processing interrupted by restart", None, None)
            .is_ok()
        {
            interrupted += 1;
            match SessionRow::from_snapshot(&session) {
                Ok(updated) => session_repo::upsert(db, &updated)?,
                Err(e) => log::error!(
                    "Session {}: failed to persist interrupted state: {}",
                    session.session_id,
                    e
                ),
            }
        }

        seen.insert(session.session_id.clone());
        loaded.push(session);
    }

    for row in session_repo::list_recent(db, recent_limit)? {
        if seen.contains(&row.id) {
            continue;
        }
        match row.parse_snapshot() {
            Ok(session) => {
                seen.insert(row.id);
                loaded.push(session);
            }
            Err(e) => log::error!("Skipping unrecoverable session '{}': {}", row.id, e),
        }
    }

    log::info!(
        "Loaded {} sessions from durable storage ({} marked interrupted)",
        loaded.len(),
        interrupted
    );

    Ok(RecoveryReport {
        loaded,
        interrupted,
    })
}
