//! Transactions and savepoints over a borrowed `may_postgres::Client`.
//!
//! A [`Transaction`] borrows the pooled client for its lifetime. Nested transactions are
//! PostgreSQL savepoints; the capacity ledger uses one to attempt a counter correction
//! without poisoning the surrounding link transaction when the correction fails.
//! Dropping an open transaction rolls it back.

use crate::error::LedgerError;
use crate::executor::{instrumented, Executor};
use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// PostgreSQL error from may_postgres
    PostgresError(PostgresError),
    /// Transaction already committed or rolled back
    TransactionClosed,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::PostgresError(e) => {
                write!(f, "PostgreSQL error: {}", e)
            }
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<PostgresError> for TransactionError {
    fn from(err: PostgresError) -> Self {
        TransactionError::PostgresError(err)
    }
}

/// A database transaction (depth 0) or savepoint (depth > 0)
pub struct Transaction<'c> {
    client: &'c Client,
    depth: u32,
    closed: bool,
}

impl<'c> Transaction<'c> {
    /// Begin a top-level READ COMMITTED transaction on `client`.
    pub fn begin(client: &'c Client) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        client.execute("BEGIN", &[]).map_err(TransactionError::from)?;

        Ok(Self {
            client,
            depth: 0,
            closed: false,
        })
    }

    /// Start a nested transaction (savepoint)
    ///
    /// Rolling back the nested transaction discards only the work done since the
    /// savepoint; the outer transaction stays usable.
    pub fn begin_nested(&mut self) -> Result<Transaction<'c>, TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        let savepoint_sql = format!("SAVEPOINT sp_{}", self.depth + 1);
        self.client
            .execute(savepoint_sql.as_str(), &[])
            .map_err(TransactionError::from)?;

        Ok(Transaction {
            client: self.client,
            depth: self.depth + 1,
            closed: false,
        })
    }

    /// Commit the transaction, or release the savepoint for a nested one.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        // closed before executing so that Drop never issues a second statement
        self.closed = true;
        if self.depth == 0 {
            self.client.execute("COMMIT", &[])?;
        } else {
            let release_sql = format!("RELEASE SAVEPOINT sp_{}", self.depth);
            self.client.execute(release_sql.as_str(), &[])?;
        }
        Ok(())
    }

    /// Roll back the transaction, or roll back to the savepoint for a nested one.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }
        self.closed = true;
        self.rollback_statement()
    }

    fn rollback_statement(&self) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        if self.depth == 0 {
            self.client.execute("ROLLBACK", &[])?;
        } else {
            let rollback_sql = format!("ROLLBACK TO SAVEPOINT sp_{}", self.depth);
            self.client.execute(rollback_sql.as_str(), &[])?;
        }
        Ok(())
    }

    /// Savepoint depth; 0 for the top-level transaction
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed.into());
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.rollback_statement() {
                log::warn!("rollback of abandoned transaction (depth {}) failed: {e}", self.depth);
            }
        }
    }
}

impl Executor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError> {
        self.ensure_open()?;
        instrumented(query, || self.client.execute(query, params))
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, LedgerError> {
        self.ensure_open()?;
        instrumented(query, || self.client.query_one(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError> {
        self.ensure_open()?;
        instrumented(query, || self.client.query(query, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::TransactionClosed;
        assert!(err
            .to_string()
            .contains("Transaction has already been committed"));
    }

    #[test]
    fn test_transaction_error_conversion() {
        let err: LedgerError = TransactionError::TransactionClosed.into();
        assert!(err.to_string().contains("already been committed"));
    }
}
