//! Session repository — CRUD operations for the `progress_sessions` table.
//!
//! Each row stores the full snapshot JSON plus cached `status`,
//! `current_phase` and `overall_percentage` columns so listings can be
//! served without deserializing the snapshot.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{Database, DatabaseError};
use crate::progress::SessionProgress;

/// A raw session row from the database.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub overall_percentage: f64,
    pub status_message: Option<String>,
    /// Full `SessionProgress` snapshot as JSON.
    pub snapshot: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            current_phase: row.get("current_phase")?,
            overall_percentage: row.get("overall_percentage")?,
            status_message: row.get("status_message")?,
            snapshot: row.get("snapshot")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Builds a complete row from an in-memory snapshot.
    pub fn from_snapshot(snapshot: &SessionProgress) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: snapshot.session_id.clone(),
            status: snapshot.status.as_str().to_string(),
            current_phase: snapshot.current_phase.clone(),
            overall_percentage: snapshot.overall_percentage,
            status_message: Some(snapshot.status_message.clone()),
            snapshot: serde_json::to_string(snapshot)?,
            created_at: format_timestamp(snapshot.created_at),
            updated_at: format_timestamp(snapshot.last_update),
            completed_at: snapshot.completed_at.map(format_timestamp),
        })
    }

    /// Decodes the stored snapshot back into a `SessionProgress`.
    pub fn parse_snapshot(&self) -> Result<SessionProgress, DatabaseError> {
        serde_json::from_str(&self.snapshot).map_err(|e| DatabaseError::CorruptSnapshot {
            session_id: self.id.clone(),
            source: e,
        })
    }
}

/// Inserts or replaces the row for a session. The write is a complete,
/// self-consistent snapshot; `created_at` survives updates.
pub fn upsert(db: &Database, row: &SessionRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO progress_sessions
                 (id, status, current_phase, overall_percentage, status_message,
                  snapshot, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 current_phase = excluded.current_phase,
                 overall_percentage = excluded.overall_percentage,
                 status_message = excluded.status_message,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at",
            params![
                row.id,
                row.status,
                row.current_phase,
                row.overall_percentage,
                row.status_message,
                row.snapshot,
                row.created_at,
                row.updated_at,
                row.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a session by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<SessionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM progress_sessions WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], SessionRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists sessions with the given status, newest first.
pub fn list_by_status(db: &Database, status: &str) -> Result<Vec<SessionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM progress_sessions WHERE status = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map(params![status], SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists sessions that were live (`pending` or `running`) at write time.
pub fn list_active(db: &Database) -> Result<Vec<SessionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM progress_sessions WHERE status IN ('pending', 'running')
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists the most recently updated sessions.
pub fn list_recent(db: &Database, limit: u64) -> Result<Vec<SessionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM progress_sessions ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a session row. Returns whether a row existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM progress_sessions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    })
}

/// Counts sessions with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM progress_sessions WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::PhaseSpec;

    fn sample_session(id: &str) -> SessionProgress {
        let mut session = SessionProgress::new(
            id,
            &[
                PhaseSpec::new("upload", 0.5),
                PhaseSpec::new("reports", 0.5),
            ],
        )
        .unwrap();
        session.start_phase("upload", None, None).unwrap();
        session
    }

    #[test]
    fn test_upsert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let session = sample_session("s1");
        let row = SessionRow::from_snapshot(&session).unwrap();
        upsert(&db, &row).unwrap();

        let found = find_by_id(&db, "s1").unwrap().unwrap();
        assert_eq!(found.status, "running");
        assert_eq!(found.current_phase.as_deref(), Some("upload"));
        assert_eq!(found.parse_snapshot().unwrap(), session);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let session = sample_session("s1");
        let row = SessionRow::from_snapshot(&session).unwrap();

        upsert(&db, &row).unwrap();
        let first = find_by_id(&db, "s1").unwrap().unwrap();
        // Persisting the same snapshot twice produces no observable difference.
        upsert(&db, &row).unwrap();
        let second = find_by_id(&db, "s1").unwrap().unwrap();

        assert_eq!(first.snapshot, second.snapshot);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.updated_at, second.updated_at);
        let count: u64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM progress_sessions", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let db = Database::open_in_memory().unwrap();
        let mut session = sample_session("s1");
        let first = SessionRow::from_snapshot(&session).unwrap();
        upsert(&db, &first).unwrap();

        session.update_phase(40.0, Some("halfway")).unwrap();
        let second = SessionRow::from_snapshot(&session).unwrap();
        upsert(&db, &second).unwrap();

        let found = find_by_id(&db, "s1").unwrap().unwrap();
        assert_eq!(found.created_at, first.created_at);
        assert_eq!(found.status_message.as_deref(), Some("halfway"));
        assert_eq!(found.overall_percentage, 20.0);
    }

    #[test]
    fn test_list_active_and_by_status() {
        let db = Database::open_in_memory().unwrap();

        let running = sample_session("r1");
        upsert(&db, &SessionRow::from_snapshot(&running).unwrap()).unwrap();

        let mut failed = sample_session("f1");
        failed.fail("pipeline", "boom", None, None).unwrap();
        upsert(&db, &SessionRow::from_snapshot(&failed).unwrap()).unwrap();

        let active = list_active(&db).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "r1");

        let failed_rows = list_by_status(&db, "failed").unwrap();
        assert_eq!(failed_rows.len(), 1);
        assert_eq!(failed_rows[0].id, "f1");

        assert_eq!(count_by_status(&db, "running").unwrap(), 1);
        assert_eq!(count_by_status(&db, "failed").unwrap(), 1);
        assert_eq!(count_by_status(&db, "completed").unwrap(), 0);
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        let session = sample_session("s1");
        upsert(&db, &SessionRow::from_snapshot(&session).unwrap()).unwrap();

        assert!(delete(&db, "s1").unwrap());
        assert!(!delete(&db, "s1").unwrap());
        assert!(find_by_id(&db, "s1").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_reported() {
        let db = Database::open_in_memory().unwrap();
        let session = sample_session("s1");
        let mut row = SessionRow::from_snapshot(&session).unwrap();
        row.snapshot = "{not json".to_string();
        upsert(&db, &row).unwrap();

        let found = find_by_id(&db, "s1").unwrap().unwrap();
        assert!(matches!(
            found.parse_snapshot(),
            Err(DatabaseError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_list_recent_limit() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            let session = sample_session(&format!("s{}", i));
            upsert(&db, &SessionRow::from_snapshot(&session).unwrap()).unwrap();
        }
        let rows = list_recent(&db, 3).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
