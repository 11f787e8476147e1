//! Crate error type
//!
//! `LedgerError` is what every store and engine operation returns. PostgreSQL errors are
//! classified on conversion so that constraint outcomes (unique, check, foreign key) reach
//! the engine as typed variants instead of opaque driver errors.

use crate::connection::ConnectionError;
use crate::transaction::TransactionError;
use may_postgres::error::SqlState;
use may_postgres::Error as PostgresError;
use std::fmt;
use std::time::Duration;

/// Ledger error type
#[derive(Debug)]
pub enum LedgerError {
    /// `PostgreSQL` error from `may_postgres` that is not a constraint outcome
    Postgres(PostgresError),
    /// Connection could not be established
    Connection(ConnectionError),
    /// Transaction control failed (begin, commit, rollback, savepoint)
    Transaction(TransactionError),
    /// No pooled connection became free in time
    PoolTimeout(Duration),
    /// A uniqueness constraint rejected the write
    UniqueViolation(String),
    /// A check constraint rejected the write (counter above capacity)
    CheckViolation(String),
    /// A parent is still referenced by links and cannot be deleted
    ParentInUse(String),
    /// The referenced entity does not exist
    NotFound(String),
    /// The code failed normalization or the configured pattern
    InvalidCode(String),
    /// The import source could not be read
    Import(String),
    /// Configuration could not be loaded or is invalid
    Config(String),
    /// Infrastructure failure that is safe to retry
    Transient(String),
    /// Other errors
    Other(String),
}

impl LedgerError {
    /// Whether the caller may retry the same operation.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Postgres(e) => is_transient_postgres(e),
            LedgerError::Transaction(TransactionError::PostgresError(e)) => is_transient_postgres(e),
            LedgerError::Connection(_) | LedgerError::PoolTimeout(_) | LedgerError::Transient(_) => {
                true
            }
            _ => false,
        }
    }

    /// Whether the underlying connection should be discarded instead of returned to the pool.
    pub fn is_connection_loss(&self) -> bool {
        let code = match self {
            LedgerError::Postgres(e) => e.code(),
            LedgerError::Transaction(TransactionError::PostgresError(e)) => e.code(),
            LedgerError::Connection(_) => return true,
            _ => return false,
        };
        match code {
            Some(code) => code.code().starts_with("08") || *code == SqlState::ADMIN_SHUTDOWN,
            // no SQLSTATE means the error came from the socket, not the server
            None => true,
        }
    }
}

fn is_transient_postgres(err: &PostgresError) -> bool {
    match err.code() {
        Some(code) => {
            *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::ADMIN_SHUTDOWN
                || code.code().starts_with("08")
        }
        None => true,
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            LedgerError::Connection(e) => write!(f, "{e}"),
            LedgerError::Transaction(e) => write!(f, "{e}"),
            LedgerError::PoolTimeout(waited) => {
                write!(f, "No pooled connection available after {waited:?}")
            }
            LedgerError::UniqueViolation(s) => write!(f, "Uniqueness violation: {s}"),
            LedgerError::CheckViolation(s) => write!(f, "Capacity constraint violation: {s}"),
            LedgerError::ParentInUse(s) => write!(f, "Parent still referenced: {s}"),
            LedgerError::NotFound(s) => write!(f, "Not found: {s}"),
            LedgerError::InvalidCode(s) => write!(f, "Invalid code: {s}"),
            LedgerError::Import(s) => write!(f, "Import error: {s}"),
            LedgerError::Config(s) => write!(f, "Configuration error: {s}"),
            LedgerError::Transient(s) => write!(f, "Transient error: {s}"),
            LedgerError::Other(s) => write!(f, "Ledger error: {s}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<PostgresError> for LedgerError {
    fn from(err: PostgresError) -> Self {
        match err.code() {
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
                LedgerError::UniqueViolation(err.to_string())
            }
            Some(code) if *code == SqlState::CHECK_VIOLATION => {
                LedgerError::CheckViolation(err.to_string())
            }
            Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
                LedgerError::ParentInUse(err.to_string())
            }
            _ => LedgerError::Postgres(err),
        }
    }
}

impl From<ConnectionError> for LedgerError {
    fn from(err: ConnectionError) -> Self {
        LedgerError::Connection(err)
    }
}

impl From<TransactionError> for LedgerError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::PostgresError(e) => LedgerError::from(e),
            other => LedgerError::Transaction(other),
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

impl From<csv::Error> for LedgerError {
    fn from(err: csv::Error) -> Self {
        LedgerError::Import(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Import(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::InvalidCode("empty".to_string());
        assert!(err.to_string().contains("Invalid code"));

        let err = LedgerError::CheckViolation("containers_unit_count_check".to_string());
        assert!(err.to_string().contains("Capacity constraint"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::Transient("deadlock".to_string()).is_transient());
        assert!(LedgerError::PoolTimeout(Duration::from_secs(1)).is_transient());
        assert!(!LedgerError::UniqueViolation("code".to_string()).is_transient());
        assert!(!LedgerError::NotFound("batch 7".to_string()).is_transient());
        assert!(!LedgerError::InvalidCode("x".to_string()).is_connection_loss());
    }

    #[test]
    fn test_transaction_error_conversion() {
        let err: LedgerError = TransactionError::TransactionClosed.into();
        assert!(matches!(err, LedgerError::Transaction(TransactionError::TransactionClosed)));
        assert!(!err.is_transient());
    }
}
