//! Weighted percentage aggregation.

use super::error::StateError;
use super::file::FilePhaseProgress;
use super::phase::{PhaseSpec, PhaseState};

/// Tolerance when validating that phase weights sum to 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Rounds to two decimal places, the precision of all reported percentages.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Validates a phase declaration: at least one phase, unique names, weights
/// in [0, 1] summing to 1.0 within tolerance.
pub fn validate_specs(specs: &[PhaseSpec]) -> Result<(), StateError> {
    if specs.is_empty() {
        return Err(StateError::EmptyPhases);
    }

    let mut sum = 0.0;
    for (i, spec) in specs.iter().enumerate() {
        if !spec.weight.is_finite() || spec.weight < 0.0 || spec.weight > 1.0 {
            return Err(StateError::InvalidWeight {
                phase: spec.name.clone(),
                weight: spec.weight,
            });
        }
        if specs[..i].iter().any(|s| s.name == spec.name) {
            return Err(StateError::DuplicatePhase(spec.name.clone()));
        }
        sum += spec.weight;
    }

    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(StateError::WeightSum { sum });
    }

    Ok(())
}

/// Share of one file that is done, 0-1. A zero-page file is a full share.
fn file_share(current_page: u32, total_pages: u32) -> f64 {
    if total_pages == 0 {
        return 1.0;
    }
    f64::from(current_page.min(total_pages)) / f64::from(total_pages)
}

/// Percentage of a multi-file phase:
/// `((files_completed + current_page/total_pages) / total_files) * 100`.
///
/// A phase with zero files reports 0 until it is explicitly completed.
pub fn file_phase_percentage(files: &FilePhaseProgress) -> f64 {
    if files.total_files == 0 {
        return 0.0;
    }

    let current = files
        .current_file
        .as_ref()
        .map_or(0.0, |f| file_share(f.current_page, f.total_pages));

    let done = f64::from(files.files_completed.min(files.total_files)) + current;
    (done / f64::from(files.total_files) * 100.0).clamp(0.0, 100.0)
}

/// Overall session percentage: the weighted sum of phase percentages,
/// clamped to [0, 100] and rounded to two decimals.
pub fn overall_percentage(phases: &[PhaseState]) -> f64 {
    let sum: f64 = phases.iter().map(|p| p.weight * p.percentage).sum();
    round2(sum.clamp(0.0, 100.0))
}
