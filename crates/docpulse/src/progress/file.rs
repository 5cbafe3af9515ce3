//! Per-file progress within a multi-file phase.

use serde::{Deserialize, Serialize};

/// Progress of a single file being processed page by page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub name: String,
    /// Total pages in the file. Zero is legal (empty or unpaged documents).
    pub total_pages: u32,
    /// 1-indexed current page, never exceeding `total_pages`.
    pub current_page: u32,
    pub matches_found: u32,
}

impl FileProgress {
    pub fn new(name: &str, total_pages: u32) -> Self {
        Self {
            name: name.to_string(),
            total_pages,
            current_page: 0,
            matches_found: 0,
        }
    }

    /// Completion of this file, 0-100. A zero-page file counts as fully
    /// processed by convention.
    pub fn percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 100.0;
        }
        f64::from(self.current_page.min(self.total_pages)) / f64::from(self.total_pages) * 100.0
    }

    /// Whether the last page has been reported. Page count alone does not
    /// complete the file; an explicit file-completion signal does.
    pub fn on_last_page(&self) -> bool {
        self.total_pages == 0 || self.current_page >= self.total_pages
    }
}

/// File tracking for a multi-file phase processed sequentially.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilePhaseProgress {
    pub total_files: u32,
    /// Count of files fully done (explicit completion signal received).
    pub files_completed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<FileProgress>,
}

impl FilePhaseProgress {
    pub fn new(total_files: u32) -> Self {
        Self {
            total_files,
            files_completed: 0,
            current_file: None,
        }
    }

    /// Total matches across the current file. Accumulated match counts for
    /// completed files live in the phase attribute bag.
    pub fn current_matches(&self) -> u32 {
        self.current_file.as_ref().map_or(0, |f| f.matches_found)
    }
}
