//! Authoritative per-session progress record and its state machine.
//!
//! One `SessionProgress` exists per pipeline run. It is mutated by exactly
//! one owner (the engine, under the session's lock); everything else sees
//! cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate;
use super::error::{ProgressError, StateError, ValidationError};
use super::file::FileProgress;
use super::phase::{PhaseSpec, PhaseState, PhaseStatus};

/// Status of a whole session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Canonical lowercase string, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and why a session failed. Attached once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    /// Failure class: `"pipeline"`, `"interrupted"`, or a producer-supplied kind.
    pub kind: String,
    pub message: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Flush hints returned by a page-level update, used by the engine to decide
/// whether the durable write bypasses the batching interval.
#[derive(Debug, Clone, Copy)]
pub struct PageOutcome {
    pub first_page_of_file: bool,
    pub last_page_of_file: bool,
}

/// The authoritative progress record for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub session_id: String,
    /// Insertion order is execution order.
    pub phases: Vec<PhaseState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// 0-100, two decimals, monotonically non-decreasing for the session's life.
    pub overall_percentage: f64,
    pub status_message: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<ErrorContext>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Rejects ids that are empty, oversized, or contain whitespace/control
/// characters. The id is otherwise opaque.
pub fn validate_session_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidSessionId {
            reason: "empty".to_string(),
        });
    }
    if id.len() > 128 {
        return Err(ValidationError::InvalidSessionId {
            reason: format!("{} bytes, maximum is 128", id.len()),
        });
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidSessionId {
            reason: "contains whitespace or control characters".to_string(),
        });
    }
    Ok(())
}

impl SessionProgress {
    /// Creates a new session with the given ordered phase declaration.
    /// Validates the id shape and that weights sum to 1.0.
    pub fn new(session_id: &str, specs: &[PhaseSpec]) -> Result<Self, ProgressError> {
        validate_session_id(session_id)?;
        aggregate::validate_specs(specs)?;

        let now = Utc::now();
        Ok(Self {
            session_id: session_id.to_string(),
            phases: specs.iter().map(PhaseState::from_spec).collect(),
            current_phase: None,
            overall_percentage: 0.0,
            status_message: "Session registered, waiting for pipeline".to_string(),
            status: SessionStatus::Pending,
            error_context: None,
            created_at: now,
            last_update: now,
            completed_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.name == name)
    }

    fn phase_index(&self, name: &str) -> Result<usize, StateError> {
        self.phases
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| StateError::UnknownPhase(name.to_string()))
    }

    fn ensure_mutable(&self) -> Result<(), StateError> {
        if self.is_terminal() {
            return Err(StateError::Terminal {
                status: self.status,
            });
        }
        Ok(())
    }

    /// The active phase, or a StateError when none is.
    fn active_phase_mut(&mut self) -> Result<&mut PhaseState, StateError> {
        let name = self
            .current_phase
            .clone()
            .ok_or(StateError::NoActivePhase)?;
        let idx = self.phase_index(&name)?;
        Ok(&mut self.phases[idx])
    }

    /// Recomputes derived percentages after a mutation. Phase percentages are
    /// raised, never lowered, so the overall stays monotonic through mid-file
    /// restarts and file boundaries.
    fn recompute(&mut self, now: DateTime<Utc>) {
        for phase in &mut self.phases {
            if phase.is_in_progress() {
                if let Some(files) = phase.files.clone() {
                    phase.raise_percentage(aggregate::file_phase_percentage(&files));
                }
            }
        }
        let overall = aggregate::overall_percentage(&self.phases);
        if overall > self.overall_percentage {
            self.overall_percentage = overall;
        }
        self.last_update = now;
    }

    /// Moves a phase to `in_progress`. All predecessor phases must be
    /// completed; `total_files` enables per-file tracking for the phase.
    pub fn start_phase(
        &mut self,
        name: &str,
        total_files: Option<u32>,
        message: Option<&str>,
    ) -> Result<(), ProgressError> {
        self.ensure_mutable()?;
        let idx = self.phase_index(name)?;

        if self.phases[idx].status != PhaseStatus::Pending {
            return Err(StateError::InvalidTransition {
                phase: name.to_string(),
                status: self.phases[idx].status,
            }
            .into());
        }
        if let Some(pred) = self.phases[..idx].iter().find(|p| !p.is_completed()) {
            return Err(StateError::PredecessorIncomplete {
                phase: name.to_string(),
                predecessor: pred.name.clone(),
            }
            .into());
        }

        let now = Utc::now();
        self.phases[idx].begin(total_files, now);
        self.current_phase = Some(name.to_string());
        if self.status == SessionStatus::Pending {
            self.status = SessionStatus::Running;
        }
        self.status_message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Phase '{}' started", name));
        self.recompute(now);
        Ok(())
    }

    /// Applies a page-level update to the current file of the active
    /// multi-file phase. Switching to an unseen file name starts tracking
    /// that file; its predecessor's share is only counted once an explicit
    /// completion signal has arrived.
    pub fn set_file_progress(
        &mut self,
        file: &str,
        current_page: u32,
        total_pages: u32,
        matches_found: u32,
    ) -> Result<PageOutcome, ProgressError> {
        self.ensure_mutable()?;

        if total_pages == 0 {
            if current_page != 0 {
                return Err(ValidationError::PageOutOfRange {
                    file: file.to_string(),
                    page: current_page,
                    total_pages,
                }
                .into());
            }
        } else if current_page < 1 || current_page > total_pages {
            return Err(ValidationError::PageOutOfRange {
                file: file.to_string(),
                page: current_page,
                total_pages,
            }
            .into());
        }

        let session_id = self.session_id.clone();
        let phase = self.active_phase_mut()?;
        if !phase.is_in_progress() {
            return Err(StateError::PhaseNotActive {
                phase: phase.name.clone(),
            }
            .into());
        }
        let phase_name = phase.name.clone();
        let files = phase.files.as_mut().ok_or(StateError::NotFilePhase {
            phase: phase_name,
        })?;

        let mut first_page = false;
        match files.current_file.as_mut() {
            Some(existing) if existing.name == file => {
                if existing.total_pages != total_pages {
                    return Err(ValidationError::PageCountChanged {
                        file: file.to_string(),
                        previous: existing.total_pages,
                        reported: total_pages,
                    }
                    .into());
                }
                if current_page < existing.current_page {
                    log::debug!(
                        "Session {}: file '{}' restarted at page {} (was at {})",
                        session_id,
                        file,
                        current_page,
                        existing.current_page
                    );
                }
                existing.current_page = current_page;
                existing.matches_found = matches_found;
            }
            previous => {
                if let Some(prev) = previous {
                    log::warn!(
                        "Session {}: file '{}' superseded '{}' without a completion signal",
                        session_id,
                        file,
                        prev.name
                    );
                }
                first_page = true;
                let mut progress = FileProgress::new(file, total_pages);
                progress.current_page = current_page;
                progress.matches_found = matches_found;
                files.current_file = Some(progress);
            }
        }
        let last_page = files
            .current_file
            .as_ref()
            .is_some_and(FileProgress::on_last_page);

        self.status_message = if total_pages == 0 {
            format!("Processing '{}'", file)
        } else {
            format!("Processing '{}' page {} of {}", file, current_page, total_pages)
        };
        self.recompute(Utc::now());
        Ok(PageOutcome {
            first_page_of_file: first_page,
            last_page_of_file: last_page,
        })
    }

    /// The explicit file-completion signal. Counts the file's full share and
    /// folds its match count into the phase attribute bag.
    pub fn complete_file(&mut self, file: &str) -> Result<(), ProgressError> {
        self.ensure_mutable()?;
        let phase = self.active_phase_mut()?;
        let phase_name = phase.name.clone();
        let files = phase.files.as_mut().ok_or(StateError::NotFilePhase {
            phase: phase_name.clone(),
        })?;

        let matches = match files.current_file.as_ref() {
            Some(current) if current.name == file => current.matches_found,
            _ => {
                return Err(StateError::FileNotCurrent {
                    file: file.to_string(),
                    phase: phase_name,
                }
                .into());
            }
        };

        files.files_completed = files.files_completed.saturating_add(1).min(files.total_files);
        files.current_file = None;

        let total = phase
            .attributes
            .get("matchesFound")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
            + u64::from(matches);
        phase
            .attributes
            .insert("matchesFound".to_string(), total.into());

        self.status_message = format!("Completed '{}'", file);
        self.recompute(Utc::now());
        Ok(())
    }

    /// Raises the active phase's percentage directly (non-file phases).
    pub fn update_phase(
        &mut self,
        percentage: f64,
        message: Option<&str>,
    ) -> Result<(), ProgressError> {
        self.ensure_mutable()?;
        if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
            return Err(ValidationError::PercentageOutOfRange { value: percentage }.into());
        }
        let phase = self.active_phase_mut()?;
        phase.raise_percentage(percentage);
        if let Some(message) = message {
            self.status_message = message.to_string();
        }
        self.recompute(Utc::now());
        Ok(())
    }

    /// Stores an opaque counter on the active phase.
    pub fn set_phase_attribute(
        &mut self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), ProgressError> {
        self.ensure_mutable()?;
        let phase = self.active_phase_mut()?;
        phase.attributes.insert(key.to_string(), value);
        self.last_update = Utc::now();
        Ok(())
    }

    /// Completes a phase at 100%. Returns true when this was the final phase
    /// and the whole session is now complete.
    pub fn complete_phase(
        &mut self,
        name: &str,
        message: Option<&str>,
    ) -> Result<bool, ProgressError> {
        self.ensure_mutable()?;
        let idx = self.phase_index(name)?;
        if !self.phases[idx].is_in_progress() {
            return Err(StateError::PhaseNotActive {
                phase: name.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        self.phases[idx].finish(now);
        self.current_phase = None;
        self.status_message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Phase '{}' completed", name));
        self.recompute(now);

        let session_completed = idx == self.phases.len() - 1;
        if session_completed {
            self.status = SessionStatus::Completed;
            self.overall_percentage = 100.0;
            self.completed_at = Some(now);
            self.status_message = message
                .map(str::to_string)
                .unwrap_or_else(|| "Processing completed successfully".to_string());
        }
        Ok(session_completed)
    }

    /// Terminates the whole session on a failure signal. The current phase is
    /// frozen as the failing phase and no further mutation is accepted.
    pub fn fail(
        &mut self,
        kind: &str,
        message: &str,
        file: Option<&str>,
        page: Option<u32>,
    ) -> Result<(), ProgressError> {
        self.ensure_mutable()?;

        let now = Utc::now();
        let phase_name = self.current_phase.clone().unwrap_or_default();
        if let Ok(phase) = self.active_phase_mut() {
            phase.status = PhaseStatus::Failed;
            phase.completed_at = Some(now);
        }

        self.error_context = Some(ErrorContext {
            kind: kind.to_string(),
            message: message.to_string(),
            phase: phase_name,
            file: file.map(str::to_string),
            page,
            timestamp: now,
        });
        self.status = SessionStatus::Failed;
        self.status_message = message.to_string();
        self.completed_at = Some(now);
        self.last_update = now;
        Ok(())
    }
}
