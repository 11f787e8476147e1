//! PostgreSQL ledger backend.
//!
//! Every [`LedgerStore::transaction`] checks one client out of the pool, runs the closure
//! inside `BEGIN … COMMIT`, and rolls back on error. Level-specific statements are
//! rendered once from the [`LevelSpec`](crate::model::LevelSpec) table and cached.
//!
//! Concurrency rests on the schema, not on process-local locks:
//! - the unique constraint on each link table's child column (one parent per child),
//! - `SELECT … FOR UPDATE` on the parent row being filled (writers of one parent queue),
//! - `CHECK (counter <= capacity)` on the parent tables as the last backstop.

use super::{
    ChildRow, CounterRow, ImportRun, LedgerStore, LedgerTx, LinkedParent, NewEntity, ParentRow,
    ScanEvent,
};
use crate::error::LedgerError;
use crate::executor::{column, Executor};
use crate::model::{EntityKind, Level};
use crate::pool::{ConnectionPool, DatabaseConfig};
use crate::schema;
use crate::transaction::Transaction;
use may_postgres::types::ToSql;
use may_postgres::Row;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;

struct LevelSql {
    find_parent: String,
    lock_parent: String,
    create_parent: String,
    delete_parent: String,
    get_or_create_child: String,
    find_child: String,
    linked_parent: String,
    insert_link: String,
    delete_link: String,
    clear_owner: String,
    count_links: String,
    refresh_counters: String,
    parent_ids: String,
    insert_links: String,
}

impl LevelSql {
    fn render(level: Level) -> Self {
        let s = level.spec();
        let parent = s.parent.table();
        let child = s.child.table();
        let link = s.link_table;
        let (pc, cc, owner) = (s.link_parent_column, s.link_child_column, s.child_owner_column);
        let parent_columns = format!("id, code, capacity, {}, {}, status", s.counter_column, s.weight_column);

        let get_or_create_child = match s.child {
            EntityKind::Unit => format!(
                "INSERT INTO {child} (code, weight) VALUES ($1, $2) \
                 ON CONFLICT (code) DO UPDATE SET code = EXCLUDED.code \
                 RETURNING id, code, weight, (xmax = 0) AS created"
            ),
            _ => format!(
                "INSERT INTO {child} (code, weight, capacity) VALUES ($1, $2, $3) \
                 ON CONFLICT (code) DO UPDATE SET code = EXCLUDED.code \
                 RETURNING id, code, weight, (xmax = 0) AS created"
            ),
        };

        Self {
            find_parent: format!("SELECT {parent_columns} FROM {parent} WHERE id = $1"),
            lock_parent: format!("SELECT {parent_columns} FROM {parent} WHERE id = $1 FOR UPDATE"),
            create_parent: format!(
                "INSERT INTO {parent} (code, capacity, status) VALUES ($1, $2, $3) \
                 RETURNING {parent_columns}"
            ),
            delete_parent: format!("DELETE FROM {parent} WHERE id = $1"),
            get_or_create_child,
            find_child: format!("SELECT id, code, weight FROM {child} WHERE code = $1"),
            linked_parent: format!(
                "SELECT l.{pc}, p.code FROM {link} l JOIN {parent} p ON p.id = l.{pc} \
                 WHERE l.{cc} = $1"
            ),
            insert_link: format!(
                "WITH inserted AS ( \
                     INSERT INTO {link} ({pc}, {cc}) VALUES ($1, $2) \
                     ON CONFLICT ({cc}) DO NOTHING RETURNING {cc} \
                 ) \
                 UPDATE {child} SET {owner} = $1 WHERE id IN (SELECT {cc} FROM inserted)"
            ),
            delete_link: format!("DELETE FROM {link} WHERE {cc} = $1 RETURNING {pc}"),
            clear_owner: format!("UPDATE {child} SET {owner} = NULL WHERE id = $1"),
            count_links: format!("SELECT COUNT(*) FROM {link} WHERE {pc} = $1"),
            refresh_counters: format!(
                "UPDATE {parent} p SET {counter} = s.cnt, {weight} = s.w, status = {status} \
                 FROM ( \
                     SELECT p2.id, p2.{counter} AS before, COUNT(l.{cc}) AS cnt, \
                            COALESCE(SUM(c.weight), 0) AS w \
                     FROM {parent} p2 \
                     LEFT JOIN {link} l ON l.{pc} = p2.id \
                     LEFT JOIN {child} c ON c.id = l.{cc} \
                     WHERE p2.id = ANY($1) \
                     GROUP BY p2.id \
                 ) s \
                 WHERE p.id = s.id \
                 RETURNING p.id, s.before, s.cnt, s.w, p.status",
                counter = s.counter_column,
                weight = s.weight_column,
                status = status_case(level),
            ),
            parent_ids: format!("SELECT id FROM {parent} ORDER BY id"),
            insert_links: format!(
                "WITH inserted AS ( \
                     INSERT INTO {link} ({pc}, {cc}) \
                     SELECT * FROM UNNEST($1::int8[], $2::int8[]) \
                     RETURNING {pc}, {cc} \
                 ) \
                 UPDATE {child} c SET {owner} = i.{pc} FROM inserted i WHERE c.id = i.{cc}"
            ),
        }
    }
}

/// SQL mirror of [`Level::status_for`] over the refreshed count `s.cnt`.
fn status_case(level: Level) -> &'static str {
    match level {
        Level::UnitToContainer => {
            "CASE WHEN s.cnt >= p.capacity THEN 'completed' ELSE 'pending' END"
        }
        Level::ContainerToBatch => {
            "CASE WHEN s.cnt = 0 THEN 'new' WHEN s.cnt >= p.capacity THEN 'completed' \
             ELSE 'processing' END"
        }
    }
}

static UNIT_TO_CONTAINER_SQL: Lazy<LevelSql> = Lazy::new(|| LevelSql::render(Level::UnitToContainer));
static CONTAINER_TO_BATCH_SQL: Lazy<LevelSql> =
    Lazy::new(|| LevelSql::render(Level::ContainerToBatch));

fn sql(level: Level) -> &'static LevelSql {
    match level {
        Level::UnitToContainer => &UNIT_TO_CONTAINER_SQL,
        Level::ContainerToBatch => &CONTAINER_TO_BATCH_SQL,
    }
}

fn insert_entities_sql(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Unit => {
            "INSERT INTO units (code, weight) \
             SELECT * FROM UNNEST($1::varchar[], $2::numeric[]) \
             RETURNING code, id"
        }
        EntityKind::Container => {
            "INSERT INTO containers (code, weight, capacity, status) \
             SELECT * FROM UNNEST($1::varchar[], $2::numeric[], $3::int8[], $4::varchar[]) \
             RETURNING code, id"
        }
        EntityKind::Batch => {
            "INSERT INTO batches (code, total_weight, capacity, status) \
             SELECT * FROM UNNEST($1::varchar[], $2::numeric[], $3::int8[], $4::varchar[]) \
             RETURNING code, id"
        }
    }
}

fn parent_from_row(row: &Row) -> Result<ParentRow, LedgerError> {
    let status: String = column(row, 5)?;
    Ok(ParentRow {
        id: column(row, 0)?,
        code: column(row, 1)?,
        capacity: column(row, 2)?,
        counter: column(row, 3)?,
        weight: column(row, 4)?,
        status: status.parse()?,
    })
}

fn child_from_row(row: &Row, created: bool) -> Result<ChildRow, LedgerError> {
    Ok(ChildRow {
        id: column(row, 0)?,
        code: column(row, 1)?,
        weight: column(row, 2)?,
        created,
    })
}

fn refresh_with<E: Executor + ?Sized>(
    exec: &E,
    level: Level,
    parent_ids: &[i64],
) -> Result<Vec<CounterRow>, LedgerError> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = exec.query_all(&sql(level).refresh_counters, &[&parent_ids])?;
    rows.iter()
        .map(|row| {
            let status: String = column(row, 4)?;
            Ok(CounterRow {
                parent_id: column(row, 0)?,
                previous_count: column(row, 1)?,
                count: column(row, 2)?,
                weight: column(row, 3)?,
                status: status.parse()?,
            })
        })
        .collect()
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// [`LedgerStore`] over a [`ConnectionPool`]
pub struct PgLedger {
    pool: ConnectionPool,
}

impl PgLedger {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, LedgerError> {
        Ok(Self::new(ConnectionPool::from_config(config)?))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Create the ledger tables and indexes if they do not exist.
    pub fn ensure_schema(&self) -> Result<(), LedgerError> {
        let conn = self.pool.acquire()?;
        schema::ensure_schema(&conn)
    }
}

impl LedgerStore for PgLedger {
    fn transaction<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, LedgerError>,
    {
        let conn = self.pool.acquire()?;
        let tx = match Transaction::begin(conn.client()?) {
            Ok(tx) => tx,
            Err(e) => {
                let err = LedgerError::from(e);
                if err.is_connection_loss() {
                    conn.mark_broken();
                }
                return Err(err);
            }
        };

        let mut ledger_tx = PgTx { tx };
        match f(&mut ledger_tx) {
            Ok(value) => {
                if let Err(e) = ledger_tx.tx.commit() {
                    let err = LedgerError::from(e);
                    if err.is_connection_loss() {
                        conn.mark_broken();
                    }
                    return Err(err);
                }
                Ok(value)
            }
            Err(err) => {
                if err.is_connection_loss() {
                    conn.mark_broken();
                } else if let Err(rollback_err) = ledger_tx.tx.rollback() {
                    log::warn!("rollback failed, discarding connection: {rollback_err}");
                    conn.mark_broken();
                }
                Err(err)
            }
        }
    }
}

struct PgTx<'c> {
    tx: Transaction<'c>,
}

impl LedgerTx for PgTx<'_> {
    fn find_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError> {
        self.tx
            .query_opt(&sql(level).find_parent, &[&id])?
            .map(|row| parent_from_row(&row))
            .transpose()
    }

    fn lock_parent(&mut self, level: Level, id: i64) -> Result<Option<ParentRow>, LedgerError> {
        self.tx
            .query_opt(&sql(level).lock_parent, &[&id])?
            .map(|row| parent_from_row(&row))
            .transpose()
    }

    fn create_parent(
        &mut self,
        level: Level,
        code: &str,
        capacity: i64,
    ) -> Result<ParentRow, LedgerError> {
        let status = level.initial_status().as_str();
        let row = self
            .tx
            .query_one(&sql(level).create_parent, &[&code, &capacity, &status])?;
        parent_from_row(&row)
    }

    fn delete_parent(&mut self, level: Level, id: i64) -> Result<bool, LedgerError> {
        Ok(self.tx.execute(&sql(level).delete_parent, &[&id])? > 0)
    }

    fn get_or_create_child(
        &mut self,
        level: Level,
        child: &NewEntity,
    ) -> Result<ChildRow, LedgerError> {
        let query = &sql(level).get_or_create_child;
        let row = match level.child_kind() {
            EntityKind::Unit => self.tx.query_one(query, &[&child.code, &child.weight])?,
            kind => {
                let capacity = child.capacity.ok_or_else(|| {
                    LedgerError::Other(format!("{kind} '{}' needs a capacity", child.code))
                })?;
                self.tx
                    .query_one(query, &[&child.code, &child.weight, &capacity])?
            }
        };
        let created: bool = column(&row, 3)?;
        child_from_row(&row, created)
    }

    fn find_child(&mut self, level: Level, code: &str) -> Result<Option<ChildRow>, LedgerError> {
        self.tx
            .query_opt(&sql(level).find_child, &[&code])?
            .map(|row| child_from_row(&row, false))
            .transpose()
    }

    fn linked_parent(
        &mut self,
        level: Level,
        child_id: i64,
    ) -> Result<Option<LinkedParent>, LedgerError> {
        self.tx
            .query_opt(&sql(level).linked_parent, &[&child_id])?
            .map(|row| {
                Ok(LinkedParent {
                    parent_id: column(&row, 0)?,
                    parent_code: column(&row, 1)?,
                })
            })
            .transpose()
    }

    fn insert_link(
        &mut self,
        level: Level,
        parent_id: i64,
        child_id: i64,
    ) -> Result<bool, LedgerError> {
        let updated = self
            .tx
            .execute(&sql(level).insert_link, &[&parent_id, &child_id])?;
        Ok(updated == 1)
    }

    fn delete_link(&mut self, level: Level, child_id: i64) -> Result<Option<i64>, LedgerError> {
        let statements = sql(level);
        let parent_id = match self.tx.query_opt(&statements.delete_link, &[&child_id])? {
            Some(row) => column::<i64>(&row, 0)?,
            None => return Ok(None),
        };
        self.tx.execute(&statements.clear_owner, &[&child_id])?;
        Ok(Some(parent_id))
    }

    fn count_links(&mut self, level: Level, parent_id: i64) -> Result<i64, LedgerError> {
        let row = self.tx.query_one(&sql(level).count_links, &[&parent_id])?;
        column(&row, 0)
    }

    fn refresh_counters(
        &mut self,
        level: Level,
        parent_ids: &[i64],
    ) -> Result<Vec<CounterRow>, LedgerError> {
        refresh_with(&self.tx, level, parent_ids)
    }

    fn try_refresh_counters(
        &mut self,
        level: Level,
        parent_ids: &[i64],
    ) -> Result<Vec<CounterRow>, LedgerError> {
        let savepoint = self.tx.begin_nested()?;
        match refresh_with(&savepoint, level, parent_ids) {
            Ok(rows) => {
                savepoint.commit()?;
                Ok(rows)
            }
            Err(err) => {
                savepoint.rollback()?;
                Err(err)
            }
        }
    }

    fn parent_ids(&mut self, level: Level) -> Result<Vec<i64>, LedgerError> {
        self.tx
            .query_all(&sql(level).parent_ids, &[])?
            .iter()
            .map(|row| column(row, 0))
            .collect()
    }

    fn record_scan(&mut self, event: &ScanEvent) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT INTO scan_events (level, parent_id, child_id, caller_id, outcome) \
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &event.level.as_str(),
                &event.parent_id,
                &event.child_id,
                &event.caller_id,
                &event.outcome.as_str(),
            ],
        )?;
        Ok(())
    }

    fn record_import(&mut self, run: &ImportRun) -> Result<(), LedgerError> {
        let counts = [
            to_db_count(run.total_groups),
            to_db_count(run.parents_created),
            to_db_count(run.children_created),
            to_db_count(run.links_created),
            to_db_count(run.error_count),
        ];
        self.tx.execute(
            "INSERT INTO import_runs (id, caller_id, source_sha256, total_groups, \
             parents_created, children_created, links_created, error_count, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &run.id,
                &run.caller_id,
                &run.source_sha256,
                &counts[0],
                &counts[1],
                &counts[2],
                &counts[3],
                &counts[4],
                &run.finished_at,
            ],
        )?;
        Ok(())
    }

    fn existing_codes(
        &mut self,
        kinds: &[EntityKind],
        codes: &[String],
    ) -> Result<Vec<String>, LedgerError> {
        if kinds.is_empty() || codes.is_empty() {
            return Ok(Vec::new());
        }
        let query = kinds
            .iter()
            .map(|kind| format!("SELECT code FROM {} WHERE code = ANY($1)", kind.table()))
            .collect::<Vec<_>>()
            .join(" UNION ");
        self.tx
            .query_all(&query, &[&codes])?
            .iter()
            .map(|row| column(row, 0))
            .collect()
    }

    fn insert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[NewEntity],
    ) -> Result<Vec<(String, i64)>, LedgerError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let codes: Vec<&str> = rows.iter().map(|r| r.code.as_str()).collect();
        let weights: Vec<Decimal> = rows.iter().map(|r| r.weight).collect();
        let query = insert_entities_sql(kind);

        let inserted = match Level::for_parent(kind) {
            None => self.tx.query_all(query, &[&codes, &weights])?,
            Some(level) => {
                let capacities = rows
                    .iter()
                    .map(|r| {
                        r.capacity.ok_or_else(|| {
                            LedgerError::Other(format!("{kind} '{}' needs a capacity", r.code))
                        })
                    })
                    .collect::<Result<Vec<i64>, _>>()?;
                let status = level.initial_status().as_str();
                let statuses = vec![status; rows.len()];
                self.tx
                    .query_all(query, &[&codes, &weights, &capacities, &statuses])?
            }
        };

        inserted
            .iter()
            .map(|row| Ok((column(row, 0)?, column(row, 1)?)))
            .collect()
    }

    fn insert_links(&mut self, level: Level, pairs: &[(i64, i64)]) -> Result<u64, LedgerError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let (parents, children): (Vec<i64>, Vec<i64>) = pairs.iter().copied().unzip();
        self.tx
            .execute(&sql(level).insert_links, &[&parents, &children])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParentStatus;

    #[test]
    fn test_status_case_covers_every_status() {
        let container = status_case(Level::UnitToContainer);
        assert!(container.contains(ParentStatus::Pending.as_str()));
        assert!(container.contains(ParentStatus::Completed.as_str()));

        let batch = status_case(Level::ContainerToBatch);
        for status in [ParentStatus::New, ParentStatus::Processing, ParentStatus::Completed] {
            assert!(batch.contains(status.as_str()));
        }
    }

    #[test]
    fn test_level_sql_uses_level_tables() {
        let units = sql(Level::UnitToContainer);
        assert!(units.count_links.contains("container_units"));
        assert!(units.lock_parent.ends_with("FOR UPDATE"));
        assert!(units.insert_link.contains("ON CONFLICT (unit_id) DO NOTHING"));
        assert!(units.get_or_create_child.starts_with("INSERT INTO units (code, weight)"));

        let batches = sql(Level::ContainerToBatch);
        assert!(batches.refresh_counters.contains("linked_count = s.cnt"));
        assert!(batches.refresh_counters.contains("total_weight = s.w"));
        assert!(batches.get_or_create_child.contains("capacity"));
    }

    #[test]
    fn test_insert_entities_sql_targets_kind_table() {
        assert!(insert_entities_sql(EntityKind::Unit).starts_with("INSERT INTO units"));
        assert!(insert_entities_sql(EntityKind::Container).contains("$4::varchar[]"));
    }
}
