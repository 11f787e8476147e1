//! [`LinkEngine`]: the entry point callers hold.
//!
//! The engine owns a [`LedgerStore`], the batch cache and the code validator. The online
//! link operation lives in [`crate::link`] and the bulk import in [`crate::import`]; this
//! module carries parent management, status reads and reconciliation.

use crate::cache::{BatchCache, BatchStatus};
use crate::capacity::{self, Correction};
use crate::config::EngineConfig;
use crate::error::LedgerError;
use crate::import::{self, ImportReport};
use crate::model::{CodeValidator, Level};
use crate::store::{LedgerStore, ParentRow};
use std::io::Read;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Capacity-bounded linking engine over a ledger store
///
/// # Examples
///
/// ```
/// use linkledger::{EngineConfig, Level, LinkEngine, MemoryLedger};
///
/// # fn main() -> Result<(), linkledger::LedgerError> {
/// let engine = LinkEngine::new(MemoryLedger::new(), EngineConfig::default())?;
/// let container = engine.create_container("C-0001", Some(2))?;
///
/// let first = engine.link_unit(container.id, "u-0001", 7);
/// assert!(first.ok);
/// assert_eq!(first.child_count, 1);
///
/// let again = engine.link_unit(container.id, "U-0001", 7);
/// assert!(again.ok);
/// assert_eq!(again.child_count, 1);
/// # Ok(())
/// # }
/// ```
pub struct LinkEngine<S: LedgerStore> {
    pub(crate) store: S,
    pub(crate) cache: BatchCache,
    pub(crate) codes: CodeValidator,
    pub(crate) config: EngineConfig,
}

impl<S: LedgerStore> LinkEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let codes = CodeValidator::new(&config.code_pattern)?;
        Ok(Self {
            store,
            cache: BatchCache::new(config.cache_ttl()),
            codes,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &BatchCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codes(&self) -> &CodeValidator {
        &self.codes
    }

    /// Register a batch with a hard container capacity.
    pub fn create_batch(&self, code: &str, capacity: i64) -> Result<ParentRow, LedgerError> {
        self.create_parent(Level::ContainerToBatch, code, capacity)
    }

    /// Register an empty container; `None` uses the configured default capacity.
    pub fn create_container(
        &self,
        code: &str,
        capacity: Option<i64>,
    ) -> Result<ParentRow, LedgerError> {
        let capacity = capacity.unwrap_or(self.config.default_container_capacity);
        self.create_parent(Level::UnitToContainer, code, capacity)
    }

    fn create_parent(&self, level: Level, code: &str, capacity: i64) -> Result<ParentRow, LedgerError> {
        let code = self.codes.normalize(code)?;
        if capacity <= 0 {
            return Err(LedgerError::CheckViolation(format!(
                "{} '{code}': capacity must be positive, got {capacity}",
                level.parent_kind()
            )));
        }
        let parent = self
            .store
            .transaction(|tx| tx.create_parent(level, &code, capacity))?;
        log::debug!("created {} {} ({}) with capacity {capacity}", level.parent_kind(), parent.id, parent.code);
        Ok(parent)
    }

    /// Delete a parent that has no links; `LedgerError::ParentInUse` otherwise.
    pub fn delete_parent(&self, level: Level, parent_id: i64) -> Result<bool, LedgerError> {
        let deleted = self
            .store
            .transaction(|tx| tx.delete_parent(level, parent_id))?;
        if level == Level::ContainerToBatch {
            self.cache.invalidate(parent_id);
        }
        Ok(deleted)
    }

    /// Linked count, capacity and status of a batch, served from the cache.
    pub fn get_batch_status(&self, batch_id: i64) -> Result<Option<BatchStatus>, LedgerError> {
        self.cache
            .get_or_load(batch_id, || self.load_batch_status(batch_id))
    }

    pub(crate) fn load_batch_status(&self, batch_id: i64) -> Result<Option<BatchStatus>, LedgerError> {
        let parent = self
            .store
            .transaction(|tx| tx.find_parent(Level::ContainerToBatch, batch_id))?;
        Ok(parent.map(BatchStatus::from_parent))
    }

    /// Rewrite one parent's counters from its links.
    ///
    /// Returns the correction applied, `None` when the counter was already right.
    pub fn reconcile(&self, level: Level, parent_id: i64) -> Result<Option<Correction>, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::reconcile_span(level.as_str()).entered();

        let correction = self
            .store
            .transaction(|tx| capacity::reconcile_and_correct(tx, level, parent_id))?;
        if level == Level::ContainerToBatch {
            self.cache.invalidate(parent_id);
        }
        Ok(correction)
    }

    /// Reconcile every parent of `level`, one transaction per chunk of parents.
    ///
    /// Parents holding more links than their capacity cannot be corrected; they are
    /// logged and skipped.
    pub fn reconcile_level(&self, level: Level) -> Result<Vec<Correction>, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::reconcile_span(level.as_str()).entered();

        let ids = self.store.transaction(|tx| tx.parent_ids(level))?;
        let mut corrections = Vec::new();

        for chunk in ids.chunks(self.config.insert_chunk_size) {
            match self.store.transaction(|tx| tx.refresh_counters(level, chunk)) {
                Ok(rows) => corrections.extend(
                    rows.iter()
                        .filter_map(|row| capacity::note_correction(level, row)),
                ),
                // one over-capacity parent fails the whole statement; retry one by one
                Err(LedgerError::CheckViolation(_)) => {
                    for &parent_id in chunk {
                        match self
                            .store
                            .transaction(|tx| capacity::reconcile_and_correct(tx, level, parent_id))
                        {
                            Ok(correction) => corrections.extend(correction),
                            Err(LedgerError::CheckViolation(msg)) => log::error!(
                                "{level} parent {parent_id} is over capacity and was not reconciled: {msg}"
                            ),
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if level == Level::ContainerToBatch {
            self.cache.clear();
        }
        log::info!(
            "reconciled {} {} parents, {} corrected",
            ids.len(),
            level,
            corrections.len()
        );
        Ok(corrections)
    }

    /// Import a CSV of containers and units under the "must be entirely new" contract.
    ///
    /// `progress` receives increasing percentages from 0 to 100.
    pub fn run_bulk_import<R: Read>(
        &self,
        source: R,
        caller_id: i64,
        mut progress: impl FnMut(u8),
    ) -> Result<ImportReport, LedgerError> {
        import::run_bulk_import(self, source, caller_id, &mut progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParentStatus;
    use crate::store::MemoryLedger;

    fn engine() -> LinkEngine<MemoryLedger> {
        LinkEngine::new(MemoryLedger::new(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            code_pattern: "(".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            LinkEngine::new(MemoryLedger::new(), config),
            Err(LedgerError::Config(_))
        ));
    }

    #[test]
    fn test_create_parents() {
        let engine = engine();
        let batch = engine.create_batch(" b-2024-01 ", 50).unwrap();
        assert_eq!(batch.code, "B-2024-01");
        assert_eq!(batch.status, ParentStatus::New);

        let container = engine.create_container("C-0001", None).unwrap();
        assert_eq!(container.capacity, 30);
        assert_eq!(container.status, ParentStatus::Pending);

        assert!(matches!(engine.create_batch("B-2", 0), Err(LedgerError::CheckViolation(_))));
        assert!(matches!(engine.create_batch("", 5), Err(LedgerError::InvalidCode(_))));
        assert!(matches!(
            engine.create_batch("B-2024-01", 5),
            Err(LedgerError::UniqueViolation(_))
        ));
    }

    #[test]
    fn test_batch_status_is_cached() {
        let engine = engine();
        let batch = engine.create_batch("B-0001", 50).unwrap();
        let status = engine.get_batch_status(batch.id).unwrap().unwrap();
        assert_eq!(status.capacity, 50);
        assert_eq!(status.linked_count, 0);
        assert_eq!(engine.cache().len(), 1);
        assert!(engine.get_batch_status(999).unwrap().is_none());
    }

    #[test]
    fn test_reconcile_level_skips_over_capacity() {
        let engine = engine();
        let healthy = engine.create_container("C-0001", Some(5)).unwrap();
        let broken = engine.create_container("C-0002", Some(1)).unwrap();
        for code in ["U-0001", "U-0002"] {
            assert!(engine.link_unit(healthy.id, code, 1).ok);
        }
        let first = engine.link_unit(broken.id, "U-0003", 1);
        assert!(first.ok);
        let extra = engine
            .store()
            .transaction(|tx| {
                tx.get_or_create_child(
                    Level::UnitToContainer,
                    &crate::store::NewEntity::unit("U-0004", rust_decimal::Decimal::ONE),
                )
            })
            .unwrap();
        engine.store().force_link(Level::UnitToContainer, broken.id, extra.id);
        engine.store().force_counter(Level::UnitToContainer, healthy.id, 0);

        let corrections = engine.reconcile_level(Level::UnitToContainer).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].parent_id, healthy.id);
        assert_eq!((corrections[0].before, corrections[0].after), (0, 2));
    }
}
