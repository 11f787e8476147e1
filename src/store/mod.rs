//! The Ledger Store: durable entities, link tables and denormalized counters.
//!
//! [`LedgerStore`] hands out one transaction at a time through a closure; the closure
//! returning `Ok` commits and returning `Err` rolls back, so no engine code path can leave a
//! transaction half-finished. [`LedgerTx`] is the statement-level surface the capacity
//! ledger, link operation and import pipeline are written against.
//!
//! Two backends implement it: [`PgLedger`] over the pooled `may_postgres` client, and
//! [`MemoryLedger`], which keeps the same constraints in process.

pub mod memory;
pub mod postgres;

pub use memory::{Fault, MemoryLedger};
pub use postgres::PgLedger;

use crate::error::LedgerError;
use crate::model::{EntityKind, Level, ParentStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// A container or batch row
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRow {
    pub id: i64,
    pub code: String,
    pub capacity: i64,
    /// Denormalized link count
    pub counter: i64,
    pub weight: Decimal,
    pub status: ParentStatus,
}

/// A unit or container row seen from the child side of a level
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub id: i64,
    pub code: String,
    pub weight: Decimal,
    /// Set when the row was inserted by this call
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedParent {
    pub parent_id: i64,
    pub parent_code: String,
}

/// Parent counters after a refresh from the link table
#[derive(Debug, Clone, PartialEq)]
pub struct CounterRow {
    pub parent_id: i64,
    /// Denormalized count before the refresh
    pub previous_count: i64,
    pub count: i64,
    pub weight: Decimal,
    pub status: ParentStatus,
}

impl CounterRow {
    pub fn drifted(&self) -> bool {
        self.previous_count != self.count
    }
}

/// Row to insert for a unit, container or batch
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub code: String,
    /// Required for containers and batches, ignored for units
    pub capacity: Option<i64>,
    pub weight: Decimal,
}

impl NewEntity {
    pub fn unit(code: impl Into<String>, weight: Decimal) -> Self {
        Self {
            code: code.into(),
            capacity: None,
            weight,
        }
    }

    pub fn parent(code: impl Into<String>, capacity: i64) -> Self {
        Self {
            code: code.into(),
            capacity: Some(capacity),
            weight: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Linked,
    AlreadyLinked,
    LinkedElsewhere,
    CapacityReached,
    Unlinked,
}

impl ScanOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanOutcome::Linked => "linked",
            ScanOutcome::AlreadyLinked => "already_linked",
            ScanOutcome::LinkedElsewhere => "linked_elsewhere",
            ScanOutcome::CapacityReached => "capacity_reached",
            ScanOutcome::Unlinked => "unlinked",
        }
    }
}

/// One online scan, recorded in the same transaction as its effect
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    pub level: Level,
    pub parent_id: i64,
    pub child_id: Option<i64>,
    pub caller_id: i64,
    pub outcome: ScanOutcome,
}

/// Summary row written at the end of a bulk import
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRun {
    pub id: Uuid,
    pub caller_id: i64,
    pub source_sha256: String,
    pub total_groups: u64,
    pub parents_created: u64,
    pub children_created: u64,
    pub links_created: u64,
    pub error_count: u64,
    pub finished_at: DateTime<Utc>,
}

/// Statements available inside one ledger transaction
pub trait LedgerTx {
    fn find_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError>;

    /// Read the parent and hold a row lock on it until the transaction ends.
    fn lock_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError>;

    fn create_parent(
        &mut self,
        level: Level,
        code: &str,
        capacity: i64,
    ) -> Result<ParentRow, LedgerError>;

    /// Delete an unlinked parent; `ParentInUse` while links reference it.
    fn delete_parent(&mut self, level: Level, id: i64) -> Result<bool, LedgerError>;

    /// Insert the child if its code is new, otherwise return the existing row.
    fn get_or_create_child(
        &mut self,
        level: Level,
        child: &NewEntity,
    ) -> Result<ChildRow, LedgerError>;

    fn find_child(&mut self, level: Level, code: &str) -> Result<Option<ChildRow>, LedgerError>;

    fn linked_parent(
        &mut self,
        level: Level,
        child_id: i64,
    ) -> Result<Option<LinkedParent>, LedgerError>;

    /// Insert one link; `false` when the child is already linked (to anyone).
    fn insert_link(&mut self, level: Level, parent_id: i64, child_id: i64)
        -> Result<bool, LedgerError>;

    /// Remove the child's link, returning the parent it belonged to.
    fn delete_link(&mut self, level: Level, child_id: i64) -> Result<Option<i64>, LedgerError>;

    /// Authoritative `COUNT(*)` over the link table
    fn count_links(&mut self, level: Level, parent_id: i64) -> Result<i64, LedgerError>;

    /// Rewrite counter, weight and status of each parent from its links.
    fn refresh_counters(
        &mut self,
        level: Level,
        parent_ids: &[i64],
    ) -> Result<Vec<CounterRow>, LedgerError>;

    /// Like [`refresh_counters`](Self::refresh_counters), but a failure leaves the
    /// transaction usable.
    fn try_refresh_counters(
        &mut self,
        level: Level,
        parent_ids: &[i64],
    ) -> Result<Vec<CounterRow>, LedgerError> {
        self.refresh_counters(level, parent_ids)
    }

    fn parent_ids(&mut self, level: Level) -> Result<Vec<i64>, LedgerError>;

    fn record_scan(&mut self, event: &ScanEvent) -> Result<(), LedgerError>;

    fn record_import(&mut self, run: &ImportRun) -> Result<(), LedgerError>;

    /// Which of `codes` already exist in any of the tables of `kinds`.
    fn existing_codes(
        &mut self,
        kinds: &[EntityKind],
        codes: &[String],
    ) -> Result<Vec<String>, LedgerError>;

    /// Multi-row insert; returns `(code, id)` for every row.
    fn insert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[NewEntity],
    ) -> Result<Vec<(String, i64)>, LedgerError>;

    /// Multi-row link insert of `(parent_id, child_id)` pairs, also setting each child's
    /// owning-parent column. A pair whose child is already linked fails the statement.
    fn insert_links(&mut self, level: Level, pairs: &[(i64, i64)]) -> Result<u64, LedgerError>;
}

/// Transaction factory
pub trait LedgerStore: Send + Sync {
    /// Run `f` in one transaction: `Ok` commits, `Err` rolls back.
    fn transaction<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, LedgerError>;
}

impl<S: LedgerStore> LedgerStore for std::sync::Arc<S> {
    fn transaction<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, LedgerError>,
    {
        (**self).transaction(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_row_drift() {
        let row = CounterRow {
            parent_id: 1,
            previous_count: 30,
            count: 12,
            weight: Decimal::from(12),
            status: ParentStatus::Pending,
        };
        assert!(row.drifted());
        assert!(!CounterRow { previous_count: 12, ..row }.drifted());
    }

    #[test]
    fn test_scan_outcome_names() {
        assert_eq!(ScanOutcome::LinkedElsewhere.as_str(), "linked_elsewhere");
        assert_eq!(
            serde_json::to_string(&ScanOutcome::CapacityReached).unwrap(),
            "\"capacity_reached\""
        );
    }
}
