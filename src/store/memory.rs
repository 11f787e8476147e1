//! In-process ledger backend.
//!
//! Transactions are serialized behind one `may` mutex and run against a copy of the state
//! that replaces the committed state only when the closure succeeds. The unique, check and
//! foreign-key constraints of the PostgreSQL schema are enforced with the same error
//! variants, so engine code cannot tell the backends apart. One-shot [`Fault`]s let tests
//! fail a specific statement to exercise rollback and degraded reconciliation.
//!
//! Every transaction clones the whole committed state, so the cost grows with the data
//! held. The backend is meant for tests and the stress harness, not for production volume.

use super::{
    ChildRow, CounterRow, ImportRun, LedgerStore, LedgerTx, LinkedParent, NewEntity, ParentRow,
    ScanEvent,
};
use crate::error::LedgerError;
use crate::model::{EntityKind, Level, ParentStatus};
use may::sync::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A one-shot disturbance of the next statement of its kind. All but
/// `InsertLinkConflict` fail that statement with `LedgerError::Transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    CountLinks,
    RefreshCounters,
    InsertLinks,
    InsertEntities,
    /// The next `insert_link` finds the child already linked to `parent_id`, as if a
    /// concurrent caller had committed that link between the check and the insert.
    InsertLinkConflict { parent_id: i64 },
}

#[derive(Debug, Clone)]
struct Record {
    id: i64,
    code: String,
    capacity: i64,
    counter: i64,
    weight: Decimal,
    status: ParentStatus,
    /// Owning parent at the level where this entity is the child
    owner: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<i64, Record>,
    by_code: HashMap<String, i64>,
    last_id: i64,
}

impl Table {
    fn insert(
        &mut self,
        code: &str,
        capacity: i64,
        weight: Decimal,
        status: ParentStatus,
    ) -> Result<i64, LedgerError> {
        if self.by_code.contains_key(code) {
            return Err(LedgerError::UniqueViolation(format!("code '{code}' already exists")));
        }
        self.last_id += 1;
        let id = self.last_id;
        self.rows.insert(
            id,
            Record {
                id,
                code: code.to_string(),
                capacity,
                counter: 0,
                weight,
                status,
                owner: None,
            },
        );
        self.by_code.insert(code.to_string(), id);
        Ok(id)
    }
}

#[derive(Debug, Clone, Default)]
struct LinkTable {
    by_child: HashMap<i64, i64>,
    by_parent: HashMap<i64, BTreeSet<i64>>,
}

impl LinkTable {
    fn insert(&mut self, parent_id: i64, child_id: i64) {
        self.by_child.insert(child_id, parent_id);
        self.by_parent.entry(parent_id).or_default().insert(child_id);
    }

    fn remove(&mut self, child_id: i64) -> Option<i64> {
        let parent_id = self.by_child.remove(&child_id)?;
        if let Some(children) = self.by_parent.get_mut(&parent_id) {
            children.remove(&child_id);
        }
        Some(parent_id)
    }

    fn count(&self, parent_id: i64) -> i64 {
        self.by_parent.get(&parent_id).map_or(0, |c| c.len() as i64)
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    units: Table,
    containers: Table,
    batches: Table,
    container_units: LinkTable,
    batch_containers: LinkTable,
    scan_events: Vec<ScanEvent>,
    import_runs: Vec<ImportRun>,
}

impl State {
    fn link(&mut self, level: Level, parent_id: i64, child_id: i64) {
        self.links_mut(level).insert(parent_id, child_id);
        if let Some(child) = self.table_mut(level.child_kind()).rows.get_mut(&child_id) {
            child.owner = Some(parent_id);
        }
    }

    fn table(&self, kind: EntityKind) -> &Table {
        match kind {
            EntityKind::Unit => &self.units,
            EntityKind::Container => &self.containers,
            EntityKind::Batch => &self.batches,
        }
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut Table {
        match kind {
            EntityKind::Unit => &mut self.units,
            EntityKind::Container => &mut self.containers,
            EntityKind::Batch => &mut self.batches,
        }
    }

    fn links(&self, level: Level) -> &LinkTable {
        match level {
            Level::UnitToContainer => &self.container_units,
            Level::ContainerToBatch => &self.batch_containers,
        }
    }

    fn links_mut(&mut self, level: Level) -> &mut LinkTable {
        match level {
            Level::UnitToContainer => &mut self.container_units,
            Level::ContainerToBatch => &mut self.batch_containers,
        }
    }

    fn parent_row(&self, level: Level, id: i64) -> Option<ParentRow> {
        self.table(level.parent_kind()).rows.get(&id).map(|r| ParentRow {
            id: r.id,
            code: r.code.clone(),
            capacity: r.capacity,
            counter: r.counter,
            weight: r.weight,
            status: r.status,
        })
    }
}

/// In-process [`LedgerStore`]
pub struct MemoryLedger {
    state: Mutex<State>,
    // outside `State` so that a rolled-back transaction does not re-arm a fault
    faults: Mutex<Vec<Fault>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next execution of `fault`'s statement.
    pub fn inject_fault(&self, fault: Fault) {
        match self.faults.lock() {
            Ok(mut faults) => faults.push(fault),
            Err(poisoned) => poisoned.into_inner().push(fault),
        }
    }

    /// Overwrite a parent's denormalized counter without touching its links.
    pub fn force_counter(&self, level: Level, parent_id: i64, counter: i64) -> bool {
        self.write(|state| {
            match state.table_mut(level.parent_kind()).rows.get_mut(&parent_id) {
                Some(record) => {
                    record.counter = counter;
                    true
                }
                None => false,
            }
        })
    }

    /// Add a link row without capacity checks or counter maintenance.
    pub fn force_link(&self, level: Level, parent_id: i64, child_id: i64) {
        self.write(|state| state.link(level, parent_id, child_id))
    }

    pub fn parent(&self, level: Level, id: i64) -> Option<ParentRow> {
        self.read(|state| state.parent_row(level, id))
    }

    /// Authoritative link count of one parent
    pub fn link_count(&self, level: Level, parent_id: i64) -> i64 {
        self.read(|state| state.links(level).count(parent_id))
    }

    /// Parent id the child with `code` is linked to, if any
    pub fn parent_of(&self, level: Level, code: &str) -> Option<i64> {
        self.read(|state| {
            let child_id = *state.table(level.child_kind()).by_code.get(code)?;
            state.links(level).by_child.get(&child_id).copied()
        })
    }

    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.read(|state| state.table(kind).rows.len())
    }

    pub fn scan_events(&self) -> Vec<ScanEvent> {
        self.read(|state| state.scan_events.clone())
    }

    pub fn import_runs(&self) -> Vec<ImportRun> {
        self.read(|state| state.import_runs.clone())
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        match self.state.lock() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl LedgerStore for MemoryLedger {
    fn transaction<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, LedgerError>,
    {
        let mut committed = self
            .state
            .lock()
            .map_err(|_| LedgerError::Other("memory ledger lock poisoned".to_string()))?;
        let mut tx = MemoryTx {
            state: committed.clone(),
            faults: &self.faults,
        };
        let result = f(&mut tx)?;
        *committed = tx.state;
        Ok(result)
    }
}

struct MemoryTx<'a> {
    state: State,
    faults: &'a Mutex<Vec<Fault>>,
}

impl MemoryTx<'_> {
    fn take(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = match self.faults.lock() {
            Ok(faults) => faults,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pos = faults.iter().position(matches)?;
        Some(faults.remove(pos))
    }

    fn trip(&self, fault: Fault) -> Result<(), LedgerError> {
        match self.take(|f| *f == fault) {
            Some(_) => Err(LedgerError::Transient(format!("injected fault: {fault:?}"))),
            None => Ok(()),
        }
    }

    fn child_row(&self, level: Level, id: i64, created: bool) -> Option<ChildRow> {
        self.state
            .table(level.child_kind())
            .rows
            .get(&id)
            .map(|r| ChildRow {
                id: r.id,
                code: r.code.clone(),
                weight: r.weight,
                created,
            })
    }

    fn insert_record(&mut self, kind: EntityKind, row: &NewEntity) -> Result<i64, LedgerError> {
        let (capacity, status) = match Level::for_parent(kind) {
            Some(level) => {
                let capacity = row.capacity.ok_or_else(|| {
                    LedgerError::Other(format!("{kind} '{}' needs a capacity", row.code))
                })?;
                if capacity <= 0 {
                    return Err(LedgerError::CheckViolation(format!(
                        "{kind} '{}' capacity must be positive",
                        row.code
                    )));
                }
                (capacity, level.initial_status())
            }
            None => (0, ParentStatus::Pending),
        };
        self.state
            .table_mut(kind)
            .insert(&row.code, capacity, row.weight, status)
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn find_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError> {
        Ok(self.state.parent_row(level, id))
    }

    fn lock_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError> {
        // every transaction already holds the ledger mutex
        self.find_parent(level, id)
    }

    fn create_parent(
        &mut self,
        level: Level,
        code: &str,
        capacity: i64,
    ) -> Result<ParentRow, LedgerError> {
        let id = self.insert_record(level.parent_kind(), &NewEntity::parent(code, capacity))?;
        self.state
            .parent_row(level, id)
            .ok_or_else(|| LedgerError::Other(format!("{} {id} vanished", level.parent_kind())))
    }

    fn delete_parent(&mut self, level: Level, id: i64) -> Result<bool, LedgerError> {
        let kind = level.parent_kind();
        let owned = match self.state.table(kind).rows.get(&id) {
            Some(record) => record.owner.is_some(),
            None => return Ok(false),
        };
        // a container is also the child of a batch link
        if owned || self.state.links(level).count(id) > 0 {
            return Err(LedgerError::ParentInUse(format!("{kind} {id} is still linked")));
        }
        let table = self.state.table_mut(kind);
        if let Some(record) = table.rows.remove(&id) {
            table.by_code.remove(&record.code);
        }
        Ok(true)
    }

    fn get_or_create_child(
        &mut self,
        level: Level,
        child: &NewEntity,
    ) -> Result<ChildRow, LedgerError> {
        let kind = level.child_kind();
        if let Some(&id) = self.state.table(kind).by_code.get(&child.code) {
            return self
                .child_row(level, id, false)
                .ok_or_else(|| LedgerError::Other(format!("{kind} {id} vanished")));
        }
        let id = self.insert_record(kind, child)?;
        self.child_row(level, id, true)
            .ok_or_else(|| LedgerError::Other(format!("{kind} {id} vanished")))
    }

    fn find_child(&mut self, level: Level, code: &str) -> Result<Option<ChildRow>, LedgerError> {
        let id = match self.state.table(level.child_kind()).by_code.get(code) {
            Some(&id) => id,
            None => return Ok(None),
        };
        Ok(self.child_row(level, id, false))
    }

    fn linked_parent(
        &mut self,
        level: Level,
        child_id: i64,
    ) -> Result<Option<LinkedParent>, LedgerError> {
        let parent_id = match self.state.links(level).by_child.get(&child_id) {
            Some(&parent_id) => parent_id,
            None => return Ok(None),
        };
        Ok(self.state.parent_row(level, parent_id).map(|p| LinkedParent {
            parent_id: p.id,
            parent_code: p.code,
        }))
    }

    fn insert_link(
        &mut self,
        level: Level,
        parent_id: i64,
        child_id: i64,
    ) -> Result<bool, LedgerError> {
        if !self.state.table(level.parent_kind()).rows.contains_key(&parent_id)
            || !self.state.table(level.child_kind()).rows.contains_key(&child_id)
        {
            return Err(LedgerError::NotFound(format!(
                "link {parent_id} -> {child_id} references a missing row"
            )));
        }
        if let Some(Fault::InsertLinkConflict { parent_id: winner }) =
            self.take(|f| matches!(f, Fault::InsertLinkConflict { .. }))
        {
            self.state.link(level, winner, child_id);
        }
        if self.state.links(level).by_child.contains_key(&child_id) {
            return Ok(false);
        }
        self.state.link(level, parent_id, child_id);
        Ok(true)
    }

    fn delete_link(&mut self, level: Level, child_id: i64) -> Result<Option<i64>, LedgerError> {
        let parent_id = self.state.links_mut(level).remove(child_id);
        if parent_id.is_some() {
            if let Some(child) = self.state.table_mut(level.child_kind()).rows.get_mut(&child_id) {
                child.owner = None;
            }
        }
        Ok(parent_id)
    }

    fn count_links(&mut self, level: Level, parent_id: i64) -> Result<i64, LedgerError> {
        self.trip(Fault::CountLinks)?;
        Ok(self.state.links(level).count(parent_id))
    }

    fn refresh_counters(
        &mut self,
        level: Level,
        parent_ids: &[i64],
    ) -> Result<Vec<CounterRow>, LedgerError> {
        self.trip(Fault::RefreshCounters)?;

        // compute everything first so that a check violation leaves no partial update
        let mut updates = Vec::with_capacity(parent_ids.len());
        for &parent_id in parent_ids {
            let parent = match self.state.table(level.parent_kind()).rows.get(&parent_id) {
                Some(parent) => parent,
                None => continue,
            };
            let children = self.state.links(level).by_parent.get(&parent_id);
            let count = children.map_or(0, |c| c.len() as i64);
            let weight = children
                .into_iter()
                .flatten()
                .filter_map(|id| self.state.table(level.child_kind()).rows.get(id))
                .map(|child| child.weight)
                .sum::<Decimal>();
            if count > parent.capacity {
                return Err(LedgerError::CheckViolation(format!(
                    "{} {parent_id}: {count} links exceed capacity {}",
                    level.parent_kind(),
                    parent.capacity
                )));
            }
            updates.push(CounterRow {
                parent_id,
                previous_count: parent.counter,
                count,
                weight,
                status: level.status_for(count, parent.capacity),
            });
        }

        let table = self.state.table_mut(level.parent_kind());
        for row in &updates {
            if let Some(parent) = table.rows.get_mut(&row.parent_id) {
                parent.counter = row.count;
                parent.weight = row.weight;
                parent.status = row.status;
            }
        }
        Ok(updates)
    }

    fn parent_ids(&mut self, level: Level) -> Result<Vec<i64>, LedgerError> {
        Ok(self.state.table(level.parent_kind()).rows.keys().copied().collect())
    }

    fn record_scan(&mut self, event: &ScanEvent) -> Result<(), LedgerError> {
        self.state.scan_events.push(event.clone());
        Ok(())
    }

    fn record_import(&mut self, run: &ImportRun) -> Result<(), LedgerError> {
        self.state.import_runs.push(run.clone());
        Ok(())
    }

    fn existing_codes(
        &mut self,
        kinds: &[EntityKind],
        codes: &[String],
    ) -> Result<Vec<String>, LedgerError> {
        Ok(codes
            .iter()
            .filter(|code| {
                kinds
                    .iter()
                    .any(|kind| self.state.table(*kind).by_code.contains_key(code.as_str()))
            })
            .cloned()
            .collect())
    }

    fn insert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[NewEntity],
    ) -> Result<Vec<(String, i64)>, LedgerError> {
        self.trip(Fault::InsertEntities)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = self.insert_record(kind, row)?;
            ids.push((row.code.clone(), id));
        }
        Ok(ids)
    }

    fn insert_links(&mut self, level: Level, pairs: &[(i64, i64)]) -> Result<u64, LedgerError> {
        self.trip(Fault::InsertLinks)?;
        let mut seen = BTreeSet::new();
        for &(parent_id, child_id) in pairs {
            if !seen.insert(child_id) || self.state.links(level).by_child.contains_key(&child_id) {
                return Err(LedgerError::UniqueViolation(format!(
                    "{} {child_id} is already linked",
                    level.child_kind()
                )));
            }
            if !self.state.table(level.parent_kind()).rows.contains_key(&parent_id) {
                return Err(LedgerError::NotFound(format!(
                    "{} {parent_id} does not exist",
                    level.parent_kind()
                )));
            }
        }
        for &(parent_id, child_id) in pairs {
            self.insert_link(level, parent_id, child_id)?;
        }
        Ok(pairs.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_container(capacity: i64) -> (MemoryLedger, i64) {
        let ledger = MemoryLedger::new();
        let id = ledger
            .transaction(|tx| tx.create_parent(Level::UnitToContainer, "C-001", capacity))
            .unwrap()
            .id;
        (ledger, id)
    }

    #[test]
    fn test_error_rolls_back_whole_transaction() {
        let (ledger, container) = ledger_with_container(5);
        let result: Result<(), LedgerError> = ledger.transaction(|tx| {
            let unit = tx.get_or_create_child(Level::UnitToContainer, &NewEntity::unit("U-001", Decimal::ONE))?;
            tx.insert_link(Level::UnitToContainer, container, unit.id)?;
            Err(LedgerError::Other("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(ledger.entity_count(EntityKind::Unit), 0);
        assert_eq!(ledger.link_count(Level::UnitToContainer, container), 0);
    }

    #[test]
    fn test_child_link_is_unique() {
        let (ledger, first) = ledger_with_container(5);
        let second = ledger
            .transaction(|tx| tx.create_parent(Level::UnitToContainer, "C-002", 5))
            .unwrap()
            .id;
        ledger
            .transaction(|tx| {
                let unit = tx.get_or_create_child(Level::UnitToContainer, &NewEntity::unit("U-001", Decimal::ONE))?;
                assert!(unit.created);
                assert!(tx.insert_link(Level::UnitToContainer, first, unit.id)?);
                assert!(!tx.insert_link(Level::UnitToContainer, second, unit.id)?);
                let again = tx.get_or_create_child(Level::UnitToContainer, &NewEntity::unit("U-001", Decimal::ONE))?;
                assert!(!again.created);
                assert_eq!(again.id, unit.id);
                Ok(())
            })
            .unwrap();
        assert_eq!(ledger.parent_of(Level::UnitToContainer, "U-001"), Some(first));
    }

    #[test]
    fn test_refresh_rejects_counter_above_capacity() {
        let (ledger, container) = ledger_with_container(1);
        let units = ledger
            .transaction(|tx| {
                tx.insert_entities(
                    EntityKind::Unit,
                    &[NewEntity::unit("U-001", Decimal::ONE), NewEntity::unit("U-002", Decimal::ONE)],
                )
            })
            .unwrap();
        for (_, id) in &units {
            ledger.force_link(Level::UnitToContainer, container, *id);
        }
        let result = ledger.transaction(|tx| tx.refresh_counters(Level::UnitToContainer, &[container]));
        assert!(matches!(result, Err(LedgerError::CheckViolation(_))));
        assert_eq!(ledger.parent(Level::UnitToContainer, container).unwrap().counter, 0);
    }

    #[test]
    fn test_delete_parent_refused_while_linked() {
        let (ledger, container) = ledger_with_container(5);
        ledger
            .transaction(|tx| {
                let unit = tx.get_or_create_child(Level::UnitToContainer, &NewEntity::unit("U-001", Decimal::ONE))?;
                tx.insert_link(Level::UnitToContainer, container, unit.id)
            })
            .unwrap();
        let result = ledger.transaction(|tx| tx.delete_parent(Level::UnitToContainer, container));
        assert!(matches!(result, Err(LedgerError::ParentInUse(_))));
    }

    #[test]
    fn test_fault_fires_once() {
        let (ledger, container) = ledger_with_container(5);
        ledger.inject_fault(Fault::CountLinks);
        let first = ledger.transaction(|tx| tx.count_links(Level::UnitToContainer, container));
        assert!(matches!(first, Err(LedgerError::Transient(_))));
        let second = ledger.transaction(|tx| tx.count_links(Level::UnitToContainer, container));
        assert_eq!(second.unwrap(), 0);
    }
}
