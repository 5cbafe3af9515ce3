//! Batched snapshot writer.
//!
//! Durable persistence is decoupled from ingestion: updates coalesce in a
//! pending map and flush at most once per batching interval per session,
//! except for forced boundaries (session creation, first/last page of a
//! file, phase transitions, terminal outcomes) which bypass the interval.
//! Writes are serialized on one background task, so at most one write is in
//! flight per session; an update arriving mid-write lands in the pending map
//! and is flushed on the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use super::error::PersistenceError;
use crate::config::EngineConfig;
use crate::db::{session_repo, Database, SessionRow};
use crate::progress::SessionProgress;

struct Pending {
    snapshot: SessionProgress,
    forced: bool,
}

struct WriterShared {
    db: Database,
    batch_interval: Duration,
    retries: u32,
    backoff: Duration,
    write_timeout: Duration,
    pending: Mutex<HashMap<String, Pending>>,
    last_flush: Mutex<HashMap<String, Instant>>,
    degraded: Mutex<HashSet<String>>,
    notify: Notify,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Writer {} lock was poisoned, recovering", what);
            poisoned.into_inner()
        }
    }
}

/// Rate-limited, coalescing persister of session snapshots.
#[derive(Clone)]
pub struct BatchedWriter {
    shared: Arc<WriterShared>,
}

impl BatchedWriter {
    /// Starts the writer's background task. Must be called within a Tokio
    /// runtime. The task stops shortly after the last handle is dropped.
    pub fn spawn(db: Database, config: &EngineConfig) -> Self {
        let shared = Arc::new(WriterShared {
            db,
            batch_interval: config.batch_interval(),
            retries: config.write_retries,
            backoff: config.write_backoff(),
            write_timeout: config.write_timeout(),
            pending: Mutex::new(HashMap::new()),
            last_flush: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        });

        let weak = Arc::downgrade(&shared);
        let tick = Duration::from_millis((config.batch_interval_ms / 5).max(50));
        tokio::spawn(run_writer(weak, tick));

        Self { shared }
    }

    /// Queues a snapshot for persistence. A newer snapshot replaces an older
    /// pending one; `forced` bypasses the batching interval.
    pub fn schedule(&self, snapshot: &SessionProgress, forced: bool) {
        {
            let mut pending = lock(&self.shared.pending, "pending");
            let entry = pending
                .entry(snapshot.session_id.clone())
                .or_insert_with(|| Pending {
                    snapshot: snapshot.clone(),
                    forced,
                });
            entry.snapshot = snapshot.clone();
            entry.forced |= forced;
        }
        // The batching window opens at the first schedule, not the first
        // successful write.
        lock(&self.shared.last_flush, "last_flush")
            .entry(snapshot.session_id.clone())
            .or_insert_with(Instant::now);
        if forced {
            self.shared.notify.notify_one();
        }
    }

    /// Whether the last write for this session exhausted its retry budget.
    /// A restart before the next successful write would lose in-flight
    /// progress; the session itself keeps operating in memory.
    pub fn is_degraded(&self, session_id: &str) -> bool {
        lock(&self.shared.degraded, "degraded").contains(session_id)
    }

    /// Drops all writer state for an evicted session.
    pub fn forget(&self, session_id: &str) {
        lock(&self.shared.pending, "pending").remove(session_id);
        lock(&self.shared.last_flush, "last_flush").remove(session_id);
        lock(&self.shared.degraded, "degraded").remove(session_id);
    }

    /// Writes out every pending snapshot immediately, ignoring the interval.
    /// Used on graceful shutdown.
    pub async fn flush_all(&self) {
        let due: Vec<(String, SessionProgress)> = {
            let mut pending = lock(&self.shared.pending, "pending");
            pending
                .drain()
                .map(|(id, p)| (id, p.snapshot))
                .collect()
        };
        for (session_id, snapshot) in due {
            write_snapshot(&self.shared, &session_id, &snapshot).await;
        }
    }
}

async fn run_writer(shared: Weak<WriterShared>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let Some(strong) = shared.upgrade() else {
            break;
        };
        {
            let notified = strong.notify.notified();
            tokio::pin!(notified);
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut notified => {}
            }
        }
        flush_due(&strong).await;
    }
    log::debug!("Batched writer task stopped");
}

/// Flushes every session that is forced or whose batching interval elapsed.
async fn flush_due(shared: &Arc<WriterShared>) {
    let now = Instant::now();
    let due: Vec<(String, SessionProgress)> = {
        let mut pending = lock(&shared.pending, "pending");
        let last_flush = lock(&shared.last_flush, "last_flush");
        let ids: Vec<String> = pending
            .iter()
            .filter(|(id, p)| {
                p.forced
                    || last_flush
                        .get(id.as_str())
                        .is_none_or(|t| now.duration_since(*t) >= shared.batch_interval)
            })
            .map(|(id, _)| String::clone(id))
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|p| (id, p.snapshot)))
            .collect()
    };

    for (session_id, snapshot) in due {
        write_snapshot(shared, &session_id, &snapshot).await;
    }
}

/// Persists one snapshot with the bounded retry/backoff budget.
async fn write_snapshot(shared: &Arc<WriterShared>, session_id: &str, snapshot: &SessionProgress) {
    let row = match SessionRow::from_snapshot(snapshot) {
        Ok(row) => row,
        Err(e) => {
            log::error!("Session {}: snapshot serialization failed: {}", session_id, e);
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        match try_write(&shared.db, row.clone(), shared.write_timeout).await {
            Ok(()) => {
                lock(&shared.last_flush, "last_flush").insert(session_id.to_string(), Instant::now());
                if lock(&shared.degraded, "degraded").remove(session_id) {
                    log::info!("Session {}: durable persistence recovered", session_id);
                }
                return;
            }
            Err(e) if attempt < shared.retries => {
                let delay = (shared.backoff * 2u32.saturating_pow(attempt))
                    .min(Duration::from_secs(2));
                log::warn!(
                    "Session {}: durable write failed ({}), retry {} of {} in {:?}",
                    session_id,
                    e,
                    attempt + 1,
                    shared.retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!(
                    "Session {}: durable write failed after {} attempts ({}); \
                     continuing in memory with degraded persistence",
                    session_id,
                    attempt + 1,
                    e
                );
                lock(&shared.degraded, "degraded").insert(session_id.to_string());
                // Keep the snapshot queued so the next pass retries, unless a
                // newer one already arrived.
                lock(&shared.pending, "pending")
                    .entry(session_id.to_string())
                    .or_insert_with(|| Pending {
                        snapshot: snapshot.clone(),
                        forced: false,
                    });
                return;
            }
        }
    }
}

/// One write attempt. The timeout bounds how long the writer waits, keeping
/// the flush loop from blocking indefinitely.
async fn try_write(
    db: &Database,
    row: SessionRow,
    write_timeout: Duration,
) -> Result<(), PersistenceError> {
    let db = db.clone();
    let task = tokio::task::spawn_blocking(move || session_repo::upsert(&db, &row));
    match tokio::time::timeout(write_timeout, task).await {
        Ok(Ok(result)) => result.map_err(PersistenceError::Database),
        Ok(Err(join)) => Err(PersistenceError::TaskFailed(join.to_string())),
        Err(_) => Err(PersistenceError::Timeout(write_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::progress::PhaseSpec;

    fn test_config() -> EngineConfig {
        EngineConfig {
            batch_interval_ms: 300,
            write_retries: 0,
            write_backoff_ms: 1,
            write_timeout_ms: 1000,
            ..EngineConfig::default()
        }
    }

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

    #[tokio::test]
    async fn test_forced_flush_is_prompt() {
        let db = Database::open_in_memory().unwrap();
        let writer = BatchedWriter::spawn(db.clone(), &test_config());

        writer.schedule(&sample_session("s1"), true);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let row = session_repo::find_by_id(&db, "s1").unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn test_batched_flush_waits_for_interval() {
        let db = Database::open_in_memory().unwrap();
        let writer = BatchedWriter::spawn(db.clone(), &test_config());

        writer.schedule(&sample_session("s1"), false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session_repo::find_by_id(&db, "s1").unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(session_repo::find_by_id(&db, "s1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest() {
        let db = Database::open_in_memory().unwrap();
        let writer = BatchedWriter::spawn(db.clone(), &test_config());

        let mut session = sample_session("s1");
        writer.schedule(&session, false);
        session.update_phase(60.0, Some("later")).unwrap();
        writer.schedule(&session, false);
        writer.flush_all().await;

        let row = session_repo::find_by_id(&db, "s1").unwrap().unwrap();
        assert_eq!(row.status_message.as_deref(), Some("later"));
        assert_eq!(row.overall_percentage, 30.0);
    }

    #[tokio::test]
    async fn test_degraded_persistence_and_recovery() {
        let db = Database::open_in_memory().unwrap();
        let writer = BatchedWriter::spawn(db.clone(), &test_config());
        let session = sample_session("s1");

        // Break the schema so writes fail.
        db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE progress_sessions;")?;
            Ok(())
        })
        .unwrap();

        writer.schedule(&session, true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(writer.is_degraded("s1"));

        // Restore the schema; the queued snapshot flushes on a later pass.
        db.with_conn(|conn| migrations::run_all(conn)).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!writer.is_degraded("s1"));
        assert!(session_repo::find_by_id(&db, "s1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forget_clears_state() {
        let db = Database::open_in_memory().unwrap();
        let writer = BatchedWriter::spawn(db, &test_config());

        writer.schedule(&sample_session("s1"), false);
        writer.forget("s1");
        writer.flush_all().await;

        assert!(!writer.is_degraded("s1"));
    }
}
