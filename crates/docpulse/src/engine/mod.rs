//! The progress engine: an explicit process-wide session table with the
//! producer-facing ingestion API and the observer-facing query/subscribe API.
//!
//! Each session is mutated under its own lock (lock-per-session, not a
//! global lock) and never across an await point. Observers only ever see
//! cloned snapshots; the event hub and the batched writer receive read-only
//! copies after every accepted mutation.

pub mod reaper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use serde::Serialize;
use uuid::Uuid;

use crate::broadcast::hub::terminal_event;
use crate::broadcast::{EventHub, SessionEvent, Subscription};
use crate::config::EngineConfig;
use crate::db::{session_repo, Database};
use crate::error::{DocpulseError, Result};
use crate::persist::{load_and_recover, BatchedWriter};
use crate::progress::{PhaseSpec, SessionProgress, SessionStatus};

pub(crate) struct SessionSlot {
    state: Mutex<SessionProgress>,
}

impl SessionSlot {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionProgress> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Session state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    pub(crate) hub: EventHub,
    pub(crate) writer: Option<BatchedWriter>,
    db: Option<Database>,
}

impl EngineInner {
    pub(crate) fn read_sessions(
        &self,
    ) -> RwLockReadGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Session table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Removes a session from memory and releases its hub and writer state.
    /// Durable rows are left in place for the reporting subsystem.
    pub(crate) fn evict(&self, session_id: &str) -> bool {
        let removed = match self.sessions.write() {
            Ok(mut guard) => guard.remove(session_id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(session_id).is_some(),
        };
        if removed {
            self.hub.close_session(session_id);
            if let Some(writer) = &self.writer {
                writer.forget(session_id);
            }
        }
        removed
    }
}

/// Session counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The progress tracking and streaming engine.
///
/// Cloning is cheap (inner `Arc`). Construct it inside a Tokio runtime: the
/// batched writer and the session reaper run as background tasks that stop
/// when the last engine handle is dropped.
#[derive(Clone)]
pub struct ProgressEngine {
    inner: Arc<EngineInner>,
}

impl ProgressEngine {
    /// Creates an engine with no durable storage: sessions live in memory
    /// only and observers still receive live updates.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, None, Vec::new()))
    }

    /// Creates an engine backed by the given database. Runs the recovery
    /// pass: sessions that were live at the last durable write are surfaced
    /// as failed/interrupted, and recent sessions are loaded for querying.
    pub fn with_database(config: EngineConfig, db: Database) -> Result<Self> {
        config.validate()?;
        let report = load_and_recover(&db, config.recovery_load_limit)?;
        Ok(Self::build(config, Some(db), report.loaded))
    }

    fn build(config: EngineConfig, db: Option<Database>, loaded: Vec<SessionProgress>) -> Self {
        let hub = EventHub::new(config.subscriber_queue_size, config.heartbeat_interval());
        let writer = db
            .as_ref()
            .map(|db| BatchedWriter::spawn(db.clone(), &config));

        let sessions = loaded
            .into_iter()
            .map(|session| {
                (
                    session.session_id.clone(),
                    Arc::new(SessionSlot {
                        state: Mutex::new(session),
                    }),
                )
            })
            .collect();

        let inner = Arc::new(EngineInner {
            config,
            sessions: RwLock::new(sessions),
            hub,
            writer,
            db,
        });
        reaper::spawn(Arc::downgrade(&inner));
        Self { inner }
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.inner
            .read_sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| DocpulseError::SessionNotFound(session_id.to_string()))
    }

    /// Publishes the snapshot to live subscribers and schedules the durable
    /// write. Terminal snapshots additionally emit the final event and close
    /// the session's subscribers.
    ///
    /// Called while still holding the session's lock so subscribers observe
    /// snapshots in mutation order. Everything here is synchronous and
    /// non-blocking (bounded `try_send`, pending-map insert).
    fn commit(&self, snapshot: SessionProgress, forced: bool) {
        let session_id = snapshot.session_id.clone();
        let terminal = snapshot.is_terminal();

        self.inner.hub.publish(
            &session_id,
            &SessionEvent::Progress {
                session: snapshot.clone(),
            },
        );
        if terminal {
            self.inner.hub.publish(&session_id, &terminal_event(&snapshot));
            self.inner.hub.close_session(&session_id);
        }

        if let Some(writer) = &self.inner.writer {
            writer.schedule(&snapshot, forced || terminal);
        }
    }

    // ─── Ingestion API (producer-only) ──────────────────────────────────

    /// Registers a new pipeline run under a generated session id.
    pub fn register_session(&self, phases: &[PhaseSpec]) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.register_session_with_id(&session_id, phases)?;
        Ok(session_id)
    }

    /// Registers a new pipeline run under a producer-supplied session id.
    pub fn register_session_with_id(
        &self,
        session_id: &str,
        phases: &[PhaseSpec],
    ) -> Result<()> {
        let session = SessionProgress::new(session_id, phases)?;
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(session),
        });

        {
            let mut sessions = match self.inner.sessions.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if sessions.contains_key(session_id) {
                return Err(DocpulseError::SessionExists(session_id.to_string()));
            }
            sessions.insert(session_id.to_string(), Arc::clone(&slot));
        }

        log::info!("Session {} registered with {} phases", session_id, phases.len());
        // first update of a session always flushes
        let state = slot.lock_state();
        self.commit(state.clone(), true);
        Ok(())
    }

    /// Moves a phase to `in_progress`. `total_files` enables per-file
    /// tracking for a multi-file phase.
    pub fn start_phase(
        &self,
        session_id: &str,
        phase: &str,
        total_files: Option<u32>,
        message: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.start_phase(phase, total_files, message)?;
        // phase boundary
        self.commit(state.clone(), true);
        Ok(())
    }

    /// Applies a page-level update within the active multi-file phase.
    pub fn set_file_progress(
        &self,
        session_id: &str,
        file: &str,
        current_page: u32,
        total_pages: u32,
        matches_found: u32,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        let outcome = state.set_file_progress(file, current_page, total_pages, matches_found)?;
        let forced = outcome.first_page_of_file || outcome.last_page_of_file;
        self.commit(state.clone(), forced);
        Ok(())
    }

    /// The explicit file-completion signal: counts the file's full share.
    pub fn complete_file(&self, session_id: &str, file: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.complete_file(file)?;
        // end-of-file boundary
        self.commit(state.clone(), true);
        Ok(())
    }

    /// Raises the active phase's percentage directly (non-file phases).
    pub fn update_phase(
        &self,
        session_id: &str,
        percentage: f64,
        message: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.update_phase(percentage, message)?;
        self.commit(state.clone(), false);
        Ok(())
    }

    /// Stores an opaque counter on the active phase.
    pub fn set_phase_attribute(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.set_phase_attribute(key, value)?;
        self.commit(state.clone(), false);
        Ok(())
    }

    /// Completes a phase at 100%. Completing the final phase completes the
    /// session and emits the terminal `complete` event.
    pub fn complete_phase(
        &self,
        session_id: &str,
        phase: &str,
        message: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.complete_phase(phase, message)?;
        self.commit(state.clone(), true);
        Ok(())
    }

    /// Terminates the session on a producer failure signal. The `error`
    /// event carries the full error context; no further updates are accepted.
    pub fn fail_session(
        &self,
        session_id: &str,
        kind: &str,
        message: &str,
        file: Option<&str>,
        page: Option<u32>,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut state = slot.lock_state();
        state.fail(kind, message, file, page)?;
        log::warn!("Session {} failed: {}", session_id, message);
        self.commit(state.clone(), true);
        Ok(())
    }

    // ─── Query / Subscribe API (observer-facing) ────────────────────────

    /// Returns the current full snapshot, falling back to durable storage
    /// for sessions already evicted from memory.
    pub fn snapshot(&self, session_id: &str) -> Result<SessionProgress> {
        if let Ok(slot) = self.slot(session_id) {
            return Ok(slot.lock_state().clone());
        }
        if let Some(db) = &self.inner.db {
            if let Some(row) = session_repo::find_by_id(db, session_id)? {
                return Ok(row.parse_snapshot()?);
            }
        }
        Err(DocpulseError::SessionNotFound(session_id.to_string()))
    }

    /// Opens a live subscription. The first event is always one `progress`
    /// snapshot of the current in-memory state; a terminal session delivers
    /// its final event right after and ends the stream.
    pub fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        let snapshot = self.snapshot(session_id)?;
        Ok(self.inner.hub.subscribe(snapshot))
    }

    /// All in-memory sessions, newest first.
    pub fn sessions(&self) -> Vec<SessionProgress> {
        let mut all: Vec<SessionProgress> = self
            .inner
            .read_sessions()
            .values()
            .map(|slot| slot.lock_state().clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Session counts by status.
    pub fn counts(&self) -> EngineCounts {
        let mut counts = EngineCounts::default();
        for slot in self.inner.read_sessions().values() {
            match slot.lock_state().status {
                SessionStatus::Pending => counts.pending += 1,
                SessionStatus::Running => counts.running += 1,
                SessionStatus::Completed => counts.completed += 1,
                SessionStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Whether the last durable write for this session exhausted its retries.
    pub fn is_persistence_degraded(&self, session_id: &str) -> bool {
        self.inner
            .writer
            .as_ref()
            .is_some_and(|w| w.is_degraded(session_id))
    }

    /// Evicts a session from memory without touching its durable row.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.inner.evict(session_id)
    }

    /// Flushes every pending durable write immediately. Call on graceful
    /// shutdown to avoid losing the batching window.
    pub async fn flush(&self) {
        if let Some(writer) = &self.inner.writer {
            writer.flush_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{PhaseStatus, StateError, ValidationError};
    use std::time::Duration;

    fn standard_phases() -> Vec<PhaseSpec> {
        vec![
            PhaseSpec::new("upload", 0.10),
            PhaseSpec::new("processing", 0.60),
            PhaseSpec::new("matching", 0.20),
            PhaseSpec::new("reports", 0.10),
        ]
    }

    fn engine() -> ProgressEngine {
        ProgressEngine::in_memory(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();

        let snapshot = engine.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Pending);
        assert_eq!(snapshot.phases.len(), 4);

        assert!(matches!(
            engine.snapshot("missing"),
            Err(DocpulseError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let engine = engine();
        engine
            .register_session_with_id("run-1", &standard_phases())
            .unwrap();
        assert!(matches!(
            engine.register_session_with_id("run-1", &standard_phases()),
            Err(DocpulseError::SessionExists(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_weights_rejected() {
        let engine = engine();
        let specs = vec![PhaseSpec::new("upload", 0.4)];
        assert!(matches!(
            engine.register_session_with_id("run-1", &specs),
            Err(DocpulseError::State(StateError::WeightSum { .. }))
        ));
        assert!(engine.snapshot("run-1").is_err());
    }

    #[tokio::test]
    async fn test_full_pipeline_run() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();

        engine.start_phase(&id, "upload", None, None).unwrap();
        engine.update_phase(&id, 100.0, None).unwrap();
        engine.complete_phase(&id, "upload", None).unwrap();

        engine
            .start_phase(&id, "processing", Some(3), None)
            .unwrap();
        engine.set_file_progress(&id, "a.pdf", 4, 4, 2).unwrap();
        engine.complete_file(&id, "a.pdf").unwrap();
        engine.set_file_progress(&id, "b.pdf", 5, 12, 1).unwrap();

        let snapshot = engine.snapshot(&id).unwrap();
        assert_eq!(snapshot.overall_percentage, 38.33);
        assert_eq!(snapshot.current_phase.as_deref(), Some("processing"));

        engine.set_file_progress(&id, "b.pdf", 12, 12, 1).unwrap();
        engine.complete_file(&id, "b.pdf").unwrap();
        engine.set_file_progress(&id, "c.pdf", 0, 0, 0).unwrap();
        engine.complete_file(&id, "c.pdf").unwrap();
        engine.complete_phase(&id, "processing", None).unwrap();

        engine.start_phase(&id, "matching", None, None).unwrap();
        engine.complete_phase(&id, "matching", None).unwrap();
        engine.start_phase(&id, "reports", None, None).unwrap();
        engine.complete_phase(&id, "reports", None).unwrap();

        let snapshot = engine.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.overall_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_failure_broadcasts_error_event() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();
        engine.start_phase(&id, "upload", None, None).unwrap();

        let mut sub = engine.subscribe(&id).unwrap();
        assert_eq!(sub.recv().await.unwrap().name(), "progress");

        engine
            .fail_session(&id, "pipeline", "extractor crashed", Some("a.pdf"), Some(2))
            .unwrap();

        // progress for the accepted mutation, then the terminal error
        assert_eq!(sub.recv().await.unwrap().name(), "progress");
        match sub.recv().await.unwrap() {
            SessionEvent::Error { error } => {
                assert_eq!(error.phase, "upload");
                assert_eq!(error.kind, "pipeline");
                assert_eq!(error.file.as_deref(), Some("a.pdf"));
            }
            other => panic!("expected error, got {}", other.name()),
        }
        assert!(sub.recv().await.is_none());

        // every later query sees the same terminal outcome
        let snapshot = engine.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(
            snapshot.error_context.as_ref().unwrap().message,
            "extractor crashed"
        );

        // and further ingestion is rejected without state change
        assert!(matches!(
            engine.update_phase(&id, 50.0, None),
            Err(DocpulseError::State(StateError::Terminal { .. }))
        ));
        assert_eq!(engine.snapshot(&id).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_subscribe_mid_session_gets_snapshot_first() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();
        engine.start_phase(&id, "upload", None, None).unwrap();
        engine.update_phase(&id, 50.0, None).unwrap();

        let mut sub = engine.subscribe(&id).unwrap();
        match sub.recv().await.unwrap() {
            SessionEvent::Progress { session } => {
                assert_eq!(session.overall_percentage, 5.0);
                assert_eq!(session.current_phase.as_deref(), Some("upload"));
            }
            other => panic!("expected progress, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_validation_errors_leave_state_unchanged() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();
        engine.start_phase(&id, "upload", None, None).unwrap();
        engine.complete_phase(&id, "upload", None).unwrap();
        engine
            .start_phase(&id, "processing", Some(2), None)
            .unwrap();
        engine.set_file_progress(&id, "a.pdf", 3, 10, 0).unwrap();

        let before = engine.snapshot(&id).unwrap();
        assert!(matches!(
            engine.set_file_progress(&id, "a.pdf", 99, 10, 0),
            Err(DocpulseError::Validation(ValidationError::PageOutOfRange { .. }))
        ));
        assert!(matches!(
            engine.set_file_progress(&id, "a.pdf", 4, 11, 0),
            Err(DocpulseError::Validation(ValidationError::PageCountChanged { .. }))
        ));
        assert_eq!(engine.snapshot(&id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_counts_and_sessions() {
        let engine = engine();
        let a = engine.register_session(&standard_phases()).unwrap();
        let b = engine.register_session(&standard_phases()).unwrap();
        engine.start_phase(&a, "upload", None, None).unwrap();
        engine.fail_session(&b, "pipeline", "boom", None, None).unwrap();

        let counts = engine.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(engine.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_phase_attribute_riding_on_snapshot() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();
        engine.start_phase(&id, "upload", None, None).unwrap();
        engine
            .set_phase_attribute(&id, "bytesReceived", 42_000.into())
            .unwrap();

        let snapshot = engine.snapshot(&id).unwrap();
        let phase = snapshot.phase("upload").unwrap();
        assert_eq!(
            phase.attributes.get("bytesReceived").and_then(|v| v.as_u64()),
            Some(42_000)
        );
        assert_eq!(phase.status, PhaseStatus::InProgress);
    }

    #[tokio::test]
    async fn test_remove_session_closes_subscribers() {
        let engine = engine();
        let id = engine.register_session(&standard_phases()).unwrap();
        let mut sub = engine.subscribe(&id).unwrap();
        assert_eq!(sub.recv().await.unwrap().name(), "progress");

        assert!(engine.remove_session(&id));
        assert!(sub.recv().await.is_none());
        assert!(engine.snapshot(&id).is_err());
    }

    #[tokio::test]
    async fn test_reaper_evicts_idle_session() {
        let config = EngineConfig {
            idle_timeout_secs: 0,
            retention_secs: 0,
            reap_interval_ms: 50,
            ..EngineConfig::default()
        };
        let engine = ProgressEngine::in_memory(config).unwrap();
        let id = engine.register_session(&standard_phases()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(engine.snapshot(&id).is_err());
    }

    #[tokio::test]
    async fn test_reaper_spares_subscribed_session() {
        let config = EngineConfig {
            idle_timeout_secs: 0,
            retention_secs: 3600,
            reap_interval_ms: 50,
            ..EngineConfig::default()
        };
        let engine = ProgressEngine::in_memory(config).unwrap();
        let id = engine.register_session(&standard_phases()).unwrap();
        let _sub = engine.subscribe(&id).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(engine.snapshot(&id).is_ok());
    }
}
