//! Ledger schema DDL.
//!
//! Tables are described with `sea-query` builders and applied with `IF NOT EXISTS`, so
//! [`ensure_schema`] is safe to run on every start. The constraints here are what the
//! engine's concurrency guarantees rest on:
//!
//! - `UNIQUE` on each link table's child column: a child has at most one parent.
//! - `CHECK (counter >= 0 AND counter <= capacity)` on containers and batches.
//! - `ON DELETE RESTRICT` from link rows to both ends: linked parents cannot be deleted.
//! - an index on each link table's parent column for `COUNT(*) WHERE parent = $1`.

use crate::error::LedgerError;
use crate::executor::Executor;
use crate::model::Level;
use sea_query::{
    ColumnDef, Expr, ForeignKey, ForeignKeyAction, Index, IndexCreateStatement,
    PostgresQueryBuilder, Table, TableCreateStatement,
};

fn id_column() -> ColumnDef {
    ColumnDef::new("id")
        .big_integer()
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}

fn code_column() -> ColumnDef {
    ColumnDef::new("code")
        .string_len(64)
        .not_null()
        .unique_key()
        .to_owned()
}

fn created_at_column(name: &'static str) -> ColumnDef {
    ColumnDef::new(name)
        .timestamp_with_time_zone()
        .not_null()
        .extra("DEFAULT CURRENT_TIMESTAMP")
        .to_owned()
}

fn batches_table() -> TableCreateStatement {
    Table::create()
        .table("batches")
        .if_not_exists()
        .col(id_column())
        .col(code_column())
        .col(ColumnDef::new("capacity").big_integer().not_null().extra("CHECK (capacity > 0)"))
        .col(
            ColumnDef::new("linked_count")
                .big_integer()
                .not_null()
                .default(0)
                .extra("CHECK (linked_count >= 0 AND linked_count <= capacity)"),
        )
        .col(ColumnDef::new("total_weight").decimal_len(14, 3).not_null().default(0))
        .col(ColumnDef::new("status").string_len(16).not_null().default("new"))
        .col(created_at_column("created_at"))
        .to_owned()
}

fn containers_table() -> TableCreateStatement {
    Table::create()
        .table("containers")
        .if_not_exists()
        .col(id_column())
        .col(code_column())
        .col(ColumnDef::new("capacity").big_integer().not_null().extra("CHECK (capacity > 0)"))
        .col(
            ColumnDef::new("unit_count")
                .big_integer()
                .not_null()
                .default(0)
                .extra("CHECK (unit_count >= 0 AND unit_count <= capacity)"),
        )
        .col(ColumnDef::new("weight").decimal_len(12, 3).not_null().default(0))
        .col(ColumnDef::new("status").string_len(16).not_null().default("pending"))
        .col(ColumnDef::new("batch_id").big_integer().null())
        .col(created_at_column("created_at"))
        .to_owned()
}

fn units_table() -> TableCreateStatement {
    Table::create()
        .table("units")
        .if_not_exists()
        .col(id_column())
        .col(code_column())
        .col(ColumnDef::new("kind").string_len(16).not_null().default("unit"))
        .col(ColumnDef::new("weight").decimal_len(12, 3).not_null().default(0))
        .col(ColumnDef::new("container_id").big_integer().null())
        .col(created_at_column("created_at"))
        .to_owned()
}

fn link_table(level: Level) -> TableCreateStatement {
    let spec = level.spec();
    let link = spec.link_table;
    Table::create()
        .table(link)
        .if_not_exists()
        .col(id_column())
        .col(ColumnDef::new(spec.link_parent_column).big_integer().not_null())
        .col(
            ColumnDef::new(spec.link_child_column)
                .big_integer()
                .not_null()
                .unique_key(),
        )
        .col(created_at_column("linked_at"))
        .foreign_key(
            ForeignKey::create()
                .name(format!("fk_{link}_parent"))
                .from(link, spec.link_parent_column)
                .to(spec.parent.table(), "id")
                .on_delete(ForeignKeyAction::Restrict),
        )
        .foreign_key(
            ForeignKey::create()
                .name(format!("fk_{link}_child"))
                .from(link, spec.link_child_column)
                .to(spec.child.table(), "id")
                .on_delete(ForeignKeyAction::Restrict),
        )
        .to_owned()
}

fn link_parent_index(level: Level) -> IndexCreateStatement {
    let spec = level.spec();
    Index::create()
        .if_not_exists()
        .name(format!("idx_{}_{}", spec.link_table, spec.link_parent_column))
        .table(spec.link_table)
        .col(Expr::col(spec.link_parent_column))
        .to_owned()
}

fn scan_events_table() -> TableCreateStatement {
    Table::create()
        .table("scan_events")
        .if_not_exists()
        .col(id_column())
        .col(ColumnDef::new("level").string_len(32).not_null())
        .col(ColumnDef::new("parent_id").big_integer().not_null())
        .col(ColumnDef::new("child_id").big_integer().null())
        .col(ColumnDef::new("caller_id").big_integer().not_null())
        .col(ColumnDef::new("outcome").string_len(32).not_null())
        .col(created_at_column("recorded_at"))
        .to_owned()
}

fn import_runs_table() -> TableCreateStatement {
    Table::create()
        .table("import_runs")
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("caller_id").big_integer().not_null())
        .col(ColumnDef::new("source_sha256").string_len(64).not_null())
        .col(ColumnDef::new("total_groups").big_integer().not_null())
        .col(ColumnDef::new("parents_created").big_integer().not_null())
        .col(ColumnDef::new("children_created").big_integer().not_null())
        .col(ColumnDef::new("links_created").big_integer().not_null())
        .col(ColumnDef::new("error_count").big_integer().not_null())
        .col(ColumnDef::new("finished_at").timestamp_with_time_zone().not_null())
        .to_owned()
}

/// Every DDL statement, in dependency order.
pub fn statements() -> Vec<String> {
    let mut sql = vec![
        batches_table().to_string(PostgresQueryBuilder),
        containers_table().to_string(PostgresQueryBuilder),
        units_table().to_string(PostgresQueryBuilder),
    ];
    for level in Level::all() {
        sql.push(link_table(level).to_string(PostgresQueryBuilder));
        sql.push(link_parent_index(level).to_string(PostgresQueryBuilder));
    }
    sql.push(scan_events_table().to_string(PostgresQueryBuilder));
    sql.push(import_runs_table().to_string(PostgresQueryBuilder));
    sql
}

/// Create the ledger tables and indexes that do not exist yet.
pub fn ensure_schema(executor: &dyn Executor) -> Result<(), LedgerError> {
    for statement in statements() {
        executor.execute(&statement, &[])?;
    }
    log::info!("ledger schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        let sql = statements();
        assert_eq!(sql.len(), 9);
        assert!(sql.iter().all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn test_link_tables_constrain_children() {
        let sql = link_table(Level::UnitToContainer).to_string(PostgresQueryBuilder);
        assert!(sql.contains("container_units"));
        assert!(sql.contains("UNIQUE"));
        assert!(sql.contains("ON DELETE RESTRICT"));

        let index = link_parent_index(Level::ContainerToBatch).to_string(PostgresQueryBuilder);
        assert!(index.contains("idx_batch_containers_batch_id"));
    }

    #[test]
    fn test_counters_are_checked_against_capacity() {
        let containers = containers_table().to_string(PostgresQueryBuilder);
        assert!(containers.contains("unit_count <= capacity"));
        let batches = batches_table().to_string(PostgresQueryBuilder);
        assert!(batches.contains("linked_count <= capacity"));
    }
}
