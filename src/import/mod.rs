//! Bulk reconciliation pipeline.
//!
//! An import file is a CSV with a `kind,code` header. Rows are grouped into one container
//! (`parent`/`p`) and its units (`child`/`c`). Everything in the file must be new: the
//! pipeline never merges into existing rows.
//!
//! - [`parse`]: pass 1, no I/O. Groups rows and rejects intra-file duplicates.
//! - [`pipeline`]: duplicate detection against the store and pass 2 bulk writes, in one
//!   transaction.
//!
//! Per-row problems end up in [`ImportReport::errors`]; only store failures abort the run.

pub mod parse;
pub mod pipeline;

pub use parse::{parse_groups, GroupMember, ImportGroup, ParsedImport};
pub use pipeline::run_bulk_import;

use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use uuid::Uuid;

/// Position of the parent row within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLayout {
    /// Units are scanned first; the container row closes the group.
    #[default]
    ParentLast,
    /// The container row opens the group; its units follow.
    ParentFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRole {
    Parent,
    Child,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// Blank or failing the code pattern
    InvalidCode,
    /// `kind` column is neither parent nor child
    UnknownKind,
    /// Code already used earlier in the same file
    DuplicateInFile,
    /// Code already present in the ledger
    ExistsInStore,
    /// Child of a rejected parent
    GroupVoided,
    /// Parent without any importable child
    EmptyGroup,
    /// More children than the container capacity
    ExceedsCapacity,
    /// Child with no parent row to attach to
    Orphaned,
    /// Row could not be read as `kind,code`
    Malformed,
}

/// One rejected row of the import file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// 1-based line number in the source, header included
    pub row_number: u64,
    pub code: String,
    pub role: RowRole,
    pub kind: RowErrorKind,
    pub reason: String,
}

impl RowError {
    pub fn new(
        row_number: u64,
        code: impl Into<String>,
        role: RowRole,
        kind: RowErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            row_number,
            code: code.into(),
            role,
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of one bulk import invocation
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub import_id: Uuid,
    pub caller_id: i64,
    pub source_sha256: String,
    /// Parent rows seen in the file, imported or not
    pub total_groups: u64,
    pub parents_created: u64,
    pub children_created: u64,
    pub links_created: u64,
    /// Sorted by row number
    pub errors: Vec<RowError>,
    pub finished_at: DateTime<Utc>,
}

impl ImportReport {
    pub fn parent_errors(&self) -> impl Iterator<Item = &RowError> {
        self.errors.iter().filter(|e| e.role == RowRole::Parent)
    }

    pub fn child_errors(&self) -> impl Iterator<Item = &RowError> {
        self.errors.iter().filter(|e| e.role == RowRole::Child)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Write the failed-row report as CSV (`row_number,code,role,kind,reason`).
    pub fn write_errors_csv<W: Write>(&self, out: W) -> Result<(), LedgerError> {
        let mut writer = csv::Writer::from_writer(out);
        for error in &self.errors {
            writer.serialize(error)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, LedgerError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LedgerError::Other(format!("failed to serialize import report: {e}")))
    }
}

/// Forwards monotonically increasing percentages to the caller's callback.
pub(crate) struct Progress<'a> {
    callback: &'a mut dyn FnMut(u8),
    last: Option<u8>,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(callback: &'a mut dyn FnMut(u8)) -> Self {
        Self {
            callback,
            last: None,
        }
    }

    pub(crate) fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            (self.callback)(percent);
        }
    }

    /// Report `done/total` of the span `from..=to`.
    pub(crate) fn report_fraction(&mut self, from: u8, to: u8, done: usize, total: usize) {
        let span = u64::from(to.saturating_sub(from));
        let step = if total == 0 {
            span
        } else {
            span * done.min(total) as u64 / total as u64
        };
        self.report(from + step as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ImportReport {
        ImportReport {
            import_id: Uuid::nil(),
            caller_id: 1,
            source_sha256: String::new(),
            total_groups: 2,
            parents_created: 1,
            children_created: 2,
            links_created: 2,
            errors: vec![
                RowError::new(4, "C-2", RowRole::Parent, RowErrorKind::DuplicateInFile, "duplicate of row 3"),
                RowError::new(5, "U-9", RowRole::Child, RowErrorKind::GroupVoided, "parent C-2 rejected"),
            ],
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_error_partitions() {
        let report = report();
        assert_eq!(report.parent_errors().count(), 1);
        assert_eq!(report.child_errors().count(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_errors_csv() {
        let mut out = Vec::new();
        report().write_errors_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("row_number,code,role,kind,reason"));
        assert_eq!(lines.next(), Some("4,C-2,parent,duplicate_in_file,duplicate of row 3"));
    }

    #[test]
    fn test_report_json() {
        let json = report().to_json().unwrap();
        assert!(json.contains("\"group_voided\""));
        assert!(json.contains("\"links_created\": 2"));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut seen = Vec::new();
        {
            let mut callback = |p: u8| seen.push(p);
            let mut progress = Progress::new(&mut callback);
            progress.report_fraction(0, 50, 0, 4);
            progress.report_fraction(0, 50, 2, 4);
            progress.report_fraction(0, 50, 2, 4);
            progress.report(40);
            progress.report_fraction(50, 64, 1, 1);
            progress.report(120);
        }
        assert_eq!(seen, vec![0, 25, 40, 64, 100]);
    }
}
