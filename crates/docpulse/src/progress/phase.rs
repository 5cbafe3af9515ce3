//! Phase state: one named, weighted stage of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file::{FilePhaseProgress, FileProgress};

/// Status of a single phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// Canonical lowercase string, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of a phase at session creation: a name and the fraction of
/// overall progress it contributes when fully complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSpec {
    pub name: String,
    pub weight: f64,
}

impl PhaseSpec {
    pub fn new(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// Live state of one phase within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub name: String,
    /// Fraction of overall progress, 0-1. Weights across phases sum to 1.0.
    pub weight: f64,
    pub status: PhaseStatus,
    /// 0-100 within the phase. Non-decreasing while the phase is in progress.
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-file tracking, present only for a multi-file phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<FilePhaseProgress>,
    /// Opaque phase-scoped counters (bytes, match totals, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl PhaseState {
    pub fn from_spec(spec: &PhaseSpec) -> Self {
        Self {
            name: spec.name.clone(),
            weight: spec.weight,
            status: PhaseStatus::Pending,
            percentage: 0.0,
            started_at: None,
            completed_at: None,
            files: None,
            attributes: serde_json::Map::new(),
        }
    }

    /// Marks the phase active. Optionally initializes multi-file tracking.
    pub(crate) fn begin(&mut self, total_files: Option<u32>, now: DateTime<Utc>) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(now);
        if let Some(total) = total_files {
            self.files = Some(FilePhaseProgress::new(total));
        }
    }

    /// Marks the phase complete at 100%.
    pub(crate) fn finish(&mut self, now: DateTime<Utc>) {
        self.status = PhaseStatus::Completed;
        self.percentage = 100.0;
        self.completed_at = Some(now);
        if let Some(files) = self.files.as_mut() {
            files.current_file = None;
        }
    }

    /// Raises the phase percentage, never lowering it. The monotonic clamp
    /// absorbs mid-file restarts and late out-of-order reports.
    pub(crate) fn raise_percentage(&mut self, candidate: f64) {
        if candidate > self.percentage {
            self.percentage = candidate.min(100.0);
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == PhaseStatus::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    /// The file currently being processed, if this is an active multi-file phase.
    pub fn current_file(&self) -> Option<&FileProgress> {
        self.files.as_ref().and_then(|f| f.current_file.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_state_from_spec() {
        let phase = PhaseState::from_spec(&PhaseSpec::new("upload", 0.25));
        assert_eq!(phase.name, "upload");
        assert_eq!(phase.status, PhaseStatus::Pending);
        assert_eq!(phase.percentage, 0.0);
        assert!(phase.files.is_none());
    }

    #[test]
    fn test_begin_with_files() {
        let mut phase = PhaseState::from_spec(&PhaseSpec::new("processing", 0.6));
        phase.begin(Some(3), Utc::now());
        assert_eq!(phase.status, PhaseStatus::InProgress);
        assert!(phase.started_at.is_some());
        assert_eq!(phase.files.as_ref().unwrap().total_files, 3);
    }

    #[test]
    fn test_finish_sets_hundred() {
        let mut phase = PhaseState::from_spec(&PhaseSpec::new("upload", 0.25));
        phase.begin(None, Utc::now());
        phase.raise_percentage(40.0);
        phase.finish(Utc::now());
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.percentage, 100.0);
        assert!(phase.completed_at.is_some());
    }

    #[test]
    fn test_raise_percentage_is_monotonic() {
        let mut phase = PhaseState::from_spec(&PhaseSpec::new("matching", 0.2));
        phase.begin(None, Utc::now());
        phase.raise_percentage(35.0);
        phase.raise_percentage(20.0);
        assert_eq!(phase.percentage, 35.0);
        phase.raise_percentage(150.0);
        assert_eq!(phase.percentage, 100.0);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            PhaseStatus::Pending,
            PhaseStatus::InProgress,
            PhaseStatus::Completed,
            PhaseStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
