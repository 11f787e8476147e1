//! Capacity ledger: counts, capacity decisions and drift correction.
//!
//! The denormalized counter on a parent row only serves reads. Every accept/reject
//! decision is made on the authoritative link count, and a counter found to disagree with
//! it is rewritten inside the caller's transaction before the decision is returned.

use crate::error::LedgerError;
use crate::model::Level;
use crate::store::{CounterRow, LedgerTx, ParentRow};
use serde::Serialize;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Counter and (optionally) authoritative count of one parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSnapshot {
    pub denormalized: i64,
    pub actual: Option<i64>,
}

impl CountSnapshot {
    pub fn drift(&self) -> Option<i64> {
        self.actual.map(|actual| actual - self.denormalized)
    }
}

/// Outcome of a capacity check against the authoritative count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityCheck {
    Available { actual: i64 },
    Full { actual: i64 },
    /// More links than capacity; never repaired automatically
    OverCapacity { actual: i64, capacity: i64 },
}

impl CapacityCheck {
    pub fn has_room(&self) -> bool {
        matches!(self, CapacityCheck::Available { .. })
    }

    pub fn actual(&self) -> i64 {
        match *self {
            CapacityCheck::Available { actual }
            | CapacityCheck::Full { actual }
            | CapacityCheck::OverCapacity { actual, .. } => actual,
        }
    }
}

/// A counter rewrite of non-zero magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub level: Level,
    pub parent_id: i64,
    pub before: i64,
    pub after: i64,
}

/// Read a parent's counter, and the authoritative count when `include_actual` is set.
pub fn current_count(
    tx: &mut dyn LedgerTx,
    level: Level,
    parent_id: i64,
    include_actual: bool,
) -> Result<Option<CountSnapshot>, LedgerError> {
    let parent = match tx.find_parent(level, parent_id)? {
        Some(parent) => parent,
        None => return Ok(None),
    };
    let actual = if include_actual {
        Some(tx.count_links(level, parent_id)?)
    } else {
        None
    };
    Ok(Some(CountSnapshot {
        denormalized: parent.counter,
        actual,
    }))
}

/// Decide whether `parent` can take one more child.
///
/// A parent that looks full is reconciled first, so a counter left at capacity by an
/// earlier failure never causes a rejection. If the reconciliation itself fails the
/// decision falls back to the authoritative count and the link table's constraints.
pub fn has_capacity(
    tx: &mut dyn LedgerTx,
    level: Level,
    parent: &ParentRow,
) -> Result<CapacityCheck, LedgerError> {
    let actual = tx.count_links(level, parent.id)?;
    let looks_full = parent.counter >= parent.capacity || actual >= parent.capacity;

    if looks_full && parent.counter != actual {
        match tx.try_refresh_counters(level, &[parent.id]) {
            Ok(rows) => {
                for row in rows.iter().filter(|row| row.drifted()) {
                    note_correction(level, row);
                }
            }
            Err(e) => log::warn!(
                "{level} parent {}: counter reconciliation failed, deciding from actual count {actual}: {e}",
                parent.id
            ),
        }
    }

    if actual < parent.capacity {
        return Ok(CapacityCheck::Available { actual });
    }
    if actual > parent.capacity {
        log::error!(
            "{level} parent {} holds {actual} links over capacity {}; operator action required",
            parent.id,
            parent.capacity
        );
        return Ok(CapacityCheck::OverCapacity {
            actual,
            capacity: parent.capacity,
        });
    }
    Ok(CapacityCheck::Full { actual })
}

/// Rewrite the parent's counter, weight and status from its links.
///
/// Returns the correction when the counter changed, `None` when it was already right.
/// Fails with `NotFound` for an unknown parent.
pub fn reconcile_and_correct(
    tx: &mut dyn LedgerTx,
    level: Level,
    parent_id: i64,
) -> Result<Option<Correction>, LedgerError> {
    let rows = tx.refresh_counters(level, &[parent_id])?;
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| LedgerError::NotFound(format!("{} {parent_id}", level.parent_kind())))?;
    Ok(note_correction(level, &row))
}

/// Log a refreshed counter row if it drifted and return it as a [`Correction`].
pub(crate) fn note_correction(level: Level, row: &CounterRow) -> Option<Correction> {
    if !row.drifted() {
        return None;
    }
    log::warn!(
        "{level} parent {}: counter drift corrected {} -> {}",
        row.parent_id,
        row.previous_count,
        row.count
    );
    #[cfg(feature = "metrics")]
    METRICS.record_drift(level.as_str());
    #[cfg(feature = "tracing")]
    tracing_helpers::drift_corrected(level.as_str(), row.parent_id, row.previous_count, row.count);

    Some(Correction {
        level,
        parent_id: row.parent_id,
        before: row.previous_count,
        after: row.count,
    })
}
