//! Online link path: attach one scanned child to a parent.
//!
//! A link call never raises. Every outcome, including store failures, comes back as a
//! [`LinkResult`] the scanning client can show as-is. Rejections that the store accepted
//! (already linked, parent full) still commit, so any counter correction made while
//! deciding is kept.

use crate::capacity::{self, CapacityCheck};
use crate::engine::LinkEngine;
use crate::error::LedgerError;
use crate::model::{EntityKind, Level};
use crate::store::{
    ChildRow, CounterRow, LedgerStore, LedgerTx, LinkedParent, NewEntity, ParentRow, ScanEvent,
    ScanOutcome,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Why a link attempt did not create a new link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkErrorKind {
    InvalidCodeFormat,
    ParentNotFound,
    /// Already linked to the requested parent; reported as success
    AlreadyLinkedSame,
    AlreadyLinkedElsewhere { parent_id: i64, parent_code: String },
    CapacityReached,
    /// Store failure; safe to retry
    TransientError,
}

impl LinkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkErrorKind::InvalidCodeFormat => "invalid_code_format",
            LinkErrorKind::ParentNotFound => "parent_not_found",
            LinkErrorKind::AlreadyLinkedSame => "already_linked_same",
            LinkErrorKind::AlreadyLinkedElsewhere { .. } => "already_linked_elsewhere",
            LinkErrorKind::CapacityReached => "capacity_reached",
            LinkErrorKind::TransientError => "transient_error",
        }
    }
}

/// Outcome of one link attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkResult {
    pub ok: bool,
    pub error_kind: Option<LinkErrorKind>,
    pub parent_id: i64,
    pub child_id: Option<i64>,
    /// Authoritative child count of the parent after the attempt
    pub child_count: i64,
    pub expected_capacity: i64,
    pub latency_ms: f64,
    pub message: String,
}

impl LinkResult {
    fn outcome(&self) -> &'static str {
        self.error_kind.as_ref().map_or("linked", LinkErrorKind::as_str)
    }
}

/// Outcome of removing a child's link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnlinkResult {
    pub removed: bool,
    pub parent_id: Option<i64>,
    pub child_id: Option<i64>,
    /// Parent's child count after the removal
    pub child_count: i64,
}

/// What the transaction decided, before latency is known
struct Attempt {
    error_kind: Option<LinkErrorKind>,
    child_id: Option<i64>,
    child_count: i64,
    capacity: i64,
    message: String,
}

impl Attempt {
    fn rejected(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind: Some(kind),
            child_id: None,
            child_count: 0,
            capacity: 0,
            message: message.into(),
        }
    }
}

impl<S: LedgerStore> LinkEngine<S> {
    /// Link a unit to a container.
    pub fn link_unit(&self, container_id: i64, unit_code: &str, caller_id: i64) -> LinkResult {
        self.link_child_to_parent(Level::UnitToContainer, container_id, unit_code, caller_id)
    }

    /// Link a container to a batch.
    pub fn link_container(&self, batch_id: i64, container_code: &str, caller_id: i64) -> LinkResult {
        self.link_child_to_parent(Level::ContainerToBatch, batch_id, container_code, caller_id)
    }

    /// Attach the child identified by `child_code` to `parent_id`, creating the child on
    /// first sight.
    ///
    /// Safe to call concurrently and to retry: a repeated call for the same pair returns
    /// `ok` with `AlreadyLinkedSame` and changes nothing.
    pub fn link_child_to_parent(
        &self,
        level: Level,
        parent_id: i64,
        child_code: &str,
        caller_id: i64,
    ) -> LinkResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::link_span(level.as_str(), parent_id).entered();

        let started = Instant::now();
        let attempt = match self.try_link(level, parent_id, child_code, caller_id) {
            Ok(attempt) => attempt,
            Err(LedgerError::NotFound(msg)) => {
                Attempt::rejected(LinkErrorKind::ParentNotFound, msg)
            }
            // the capacity constraint caught what the lock did not
            Err(LedgerError::CheckViolation(msg)) => {
                log::warn!("{level} parent {parent_id}: link rejected by capacity constraint: {msg}");
                Attempt::rejected(LinkErrorKind::CapacityReached, "parent is full")
            }
            Err(e) => {
                log::warn!("{level} parent {parent_id}: link of '{child_code}' failed: {e}");
                Attempt::rejected(LinkErrorKind::TransientError, e.to_string())
            }
        };
        let elapsed = started.elapsed();

        if level == Level::ContainerToBatch {
            self.cache.invalidate(parent_id);
        }

        let result = LinkResult {
            ok: matches!(attempt.error_kind, None | Some(LinkErrorKind::AlreadyLinkedSame)),
            error_kind: attempt.error_kind,
            parent_id,
            child_id: attempt.child_id,
            child_count: attempt.child_count,
            expected_capacity: attempt.capacity,
            latency_ms: elapsed.as_secs_f64() * 1000.0,
            message: attempt.message,
        };

        #[cfg(feature = "metrics")]
        METRICS.record_link(level.as_str(), result.outcome(), elapsed);
        log::debug!(
            "{level} parent {parent_id} child '{child_code}': {} in {:.2}ms",
            result.outcome(),
            result.latency_ms
        );
        result
    }

    fn try_link(
        &self,
        level: Level,
        parent_id: i64,
        child_code: &str,
        caller_id: i64,
    ) -> Result<Attempt, LedgerError> {
        let code = match self.codes.normalize(child_code) {
            Ok(code) => code,
            Err(e) => return Ok(Attempt::rejected(LinkErrorKind::InvalidCodeFormat, e.to_string())),
        };

        if level == Level::ContainerToBatch
            && self
                .cache
                .get_or_load(parent_id, || self.load_batch_status(parent_id))?
                .is_none()
        {
            return Err(LedgerError::NotFound(format!("batch {parent_id}")));
        }

        let child = self.new_child(level, code);
        self.store.transaction(|tx| {
            let child = tx.get_or_create_child(level, &child)?;
            if child.created {
                log::debug!("created {} {} ({})", level.child_kind(), child.id, child.code);
            }
            if let Some(linked) = tx.linked_parent(level, child.id)? {
                return already_linked(tx, level, parent_id, &child, linked, caller_id);
            }

            let parent = tx
                .lock_parent(level, parent_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("{} {parent_id}", level.parent_kind())))?;
            let check = capacity::has_capacity(tx, level, &parent)?;
            if !check.has_room() {
                return capacity_reached(tx, level, &parent, &child, check, caller_id);
            }

            if !tx.insert_link(level, parent.id, child.id)? {
                // another caller linked the child between our check and insert
                let linked = tx.linked_parent(level, child.id)?.ok_or_else(|| {
                    LedgerError::Transient(format!("link of {} {} vanished", level.child_kind(), child.id))
                })?;
                return already_linked(tx, level, parent_id, &child, linked, caller_id);
            }

            let row = tx
                .refresh_counters(level, &[parent.id])?
                .into_iter()
                .next()
                .ok_or_else(|| LedgerError::NotFound(format!("{} {}", level.parent_kind(), parent.id)))?;
            if row.previous_count != check.actual() {
                // the counter was wrong before this link; report it against the pre-link truth
                capacity::note_correction(
                    level,
                    &CounterRow {
                        count: check.actual(),
                        ..row.clone()
                    },
                );
            }
            tx.record_scan(&ScanEvent {
                level,
                parent_id: parent.id,
                child_id: Some(child.id),
                caller_id,
                outcome: ScanOutcome::Linked,
            })?;

            Ok(Attempt {
                error_kind: None,
                child_id: Some(child.id),
                child_count: row.count,
                capacity: parent.capacity,
                message: format!("linked {} {} to {}", level.child_kind(), child.code, parent.code),
            })
        })
    }

    fn new_child(&self, level: Level, code: String) -> NewEntity {
        match level.child_kind() {
            EntityKind::Container => NewEntity {
                code,
                capacity: Some(self.config.default_container_capacity),
                weight: Decimal::ZERO,
            },
            _ => NewEntity::unit(code, self.config.unit_weight),
        }
    }

    /// Remove the link of the child identified by `child_code`, if any.
    pub fn unlink_child(
        &self,
        level: Level,
        child_code: &str,
        caller_id: i64,
    ) -> Result<UnlinkResult, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::unlink_span(level.as_str()).entered();

        let code = self.codes.normalize(child_code)?;
        let result = self.store.transaction(|tx| {
            let not_linked = |child_id| UnlinkResult {
                removed: false,
                parent_id: None,
                child_id,
                child_count: 0,
            };
            let child = match tx.find_child(level, &code)? {
                Some(child) => child,
                None => return Ok(not_linked(None)),
            };
            let linked = match tx.linked_parent(level, child.id)? {
                Some(linked) => linked,
                None => return Ok(not_linked(Some(child.id))),
            };

            tx.lock_parent(level, linked.parent_id)?;
            let parent_id = match tx.delete_link(level, child.id)? {
                Some(parent_id) => parent_id,
                None => return Ok(not_linked(Some(child.id))),
            };
            // an over-capacity parent keeps its counter until unlinks bring it back within
            // capacity; the unlink itself must still go through
            let count = match tx.try_refresh_counters(level, &[parent_id]) {
                Ok(rows) => rows.first().map_or(0, |row| row.count),
                Err(LedgerError::CheckViolation(e)) => {
                    let actual = tx.count_links(level, parent_id)?;
                    log::error!(
                        "{level} parent {parent_id} still holds {actual} links over capacity after unlink; counter left unchanged: {e}"
                    );
                    actual
                }
                Err(e) => return Err(e),
            };
            tx.record_scan(&ScanEvent {
                level,
                parent_id,
                child_id: Some(child.id),
                caller_id,
                outcome: ScanOutcome::Unlinked,
            })?;

            Ok(UnlinkResult {
                removed: true,
                parent_id: Some(parent_id),
                child_id: Some(child.id),
                child_count: count,
            })
        })?;

        if let (Level::ContainerToBatch, Some(parent_id)) = (level, result.parent_id) {
            self.cache.invalidate(parent_id);
        }
        log::info!(
            "{level} unlink of '{code}' by caller {caller_id}: {}",
            if result.removed { "removed" } else { "not linked" }
        );
        Ok(result)
    }
}

fn already_linked(
    tx: &mut dyn LedgerTx,
    level: Level,
    requested: i64,
    child: &ChildRow,
    linked: LinkedParent,
    caller_id: i64,
) -> Result<Attempt, LedgerError> {
    let same = linked.parent_id == requested;
    let capacity = tx
        .find_parent(level, linked.parent_id)?
        .map_or(0, |parent| parent.capacity);
    let child_count = tx.count_links(level, linked.parent_id)?;
    tx.record_scan(&ScanEvent {
        level,
        parent_id: requested,
        child_id: Some(child.id),
        caller_id,
        outcome: if same {
            ScanOutcome::AlreadyLinked
        } else {
            ScanOutcome::LinkedElsewhere
        },
    })?;

    let (error_kind, message) = if same {
        (
            LinkErrorKind::AlreadyLinkedSame,
            format!("{} {} already linked", level.child_kind(), child.code),
        )
    } else {
        let message = format!(
            "{} {} is linked to {} {}",
            level.child_kind(),
            child.code,
            level.parent_kind(),
            linked.parent_code
        );
        (
            LinkErrorKind::AlreadyLinkedElsewhere {
                parent_id: linked.parent_id,
                parent_code: linked.parent_code,
            },
            message,
        )
    };
    Ok(Attempt {
        error_kind: Some(error_kind),
        child_id: Some(child.id),
        child_count,
        capacity,
        message,
    })
}

fn capacity_reached(
    tx: &mut dyn LedgerTx,
    level: Level,
    parent: &ParentRow,
    child: &ChildRow,
    check: CapacityCheck,
    caller_id: i64,
) -> Result<Attempt, LedgerError> {
    tx.record_scan(&ScanEvent {
        level,
        parent_id: parent.id,
        child_id: Some(child.id),
        caller_id,
        outcome: ScanOutcome::CapacityReached,
    })?;
    Ok(Attempt {
        error_kind: Some(LinkErrorKind::CapacityReached),
        child_id: Some(child.id),
        child_count: check.actual(),
        capacity: parent.capacity,
        message: format!(
            "{} {} is full ({}/{})",
            level.parent_kind(),
            parent.code,
            check.actual(),
            parent.capacity
        ),
    })
}
