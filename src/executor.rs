//! `Executor` trait over `may_postgres`.
//!
//! Both a pooled connection and an open [`Transaction`](crate::transaction::Transaction)
//! implement [`Executor`], so schema setup and the PostgreSQL ledger backend are written
//! once against the trait. Every statement goes through [`instrumented`], which records
//! query duration and errors and opens a query span when the respective features are on.

use crate::error::LedgerError;
use may_postgres::types::{FromSql, ToSql};
use may_postgres::{Error as PostgresError, Row};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Trait for executing database operations
///
/// # Examples
///
/// ```no_run
/// use linkledger::executor::Executor;
/// use linkledger::pool::{ConnectionPool, DatabaseConfig};
///
/// # fn main() -> Result<(), linkledger::LedgerError> {
/// let pool = ConnectionPool::from_config(&DatabaseConfig::default())?;
/// let conn = pool.acquire()?;
/// let row = conn.query_one("SELECT COUNT(*) FROM container_units WHERE container_id = $1", &[&7i64])?;
/// let count: i64 = row.get(0);
/// # Ok(())
/// # }
/// ```
pub trait Executor {
    /// Execute a SQL statement and return the number of rows affected
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError>;

    /// Execute a query that must return exactly one row
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, LedgerError>;

    /// Execute a query and return all rows
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError>;

    /// Execute a query that returns zero or one row
    fn query_opt(&self, query: &str, params: &[&dyn ToSql]) -> Result<Option<Row>, LedgerError> {
        Ok(self.query_all(query, params)?.into_iter().next())
    }
}

/// Run one driver call with the query span, duration histogram and error counter applied.
pub(crate) fn instrumented<T>(
    query: &str,
    call: impl FnOnce() -> Result<T, PostgresError>,
) -> Result<T, LedgerError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(query).entered();

    let start = Instant::now();
    let result = call().map_err(|e| {
        #[cfg(feature = "metrics")]
        METRICS.record_query_error();
        log::debug!("statement failed: {e}; sql: {}", query.trim());
        LedgerError::from(e)
    });

    #[cfg(feature = "metrics")]
    METRICS.record_query_duration(start.elapsed());
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    result
}

/// Extract one column from a row, reporting decode failures as `LedgerError::Other`.
pub fn column<'a, T>(row: &'a Row, idx: usize) -> Result<T, LedgerError>
where
    T: FromSql<'a>,
{
    row.try_get::<usize, T>(idx)
        .map_err(|e| LedgerError::Other(format!("Failed to decode column {idx}: {e}")))
}

/// Query a single value from the first column of the single returned row
pub fn query_value<T, E: Executor + ?Sized>(
    executor: &E,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<T, LedgerError>
where
    T: for<'a> FromSql<'a>,
{
    let row = executor.query_one(sql, params)?;
    column::<T>(&row, 0)
}
