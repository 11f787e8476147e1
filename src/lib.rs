//! # Linkledger
//!
//! Capacity-bounded linking of units into containers and containers into batches, on
//! PostgreSQL for the `may` coroutine runtime.
//!
//! - [`LinkEngine::link_child_to_parent`]: online, idempotent, race-safe single link.
//! - [`LinkEngine::run_bulk_import`]: two-pass CSV import of entirely new containers.
//! - [`LinkEngine::reconcile`]: rewrite denormalized counters from the link tables.
//!
//! Storage sits behind [`LedgerStore`]: [`PgLedger`] in production, [`MemoryLedger`] for
//! tests and the stress harness.

pub mod cache;
pub mod capacity;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod import;
pub mod link;
#[cfg(feature = "tracing")]
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod schema;
pub mod store;
pub mod transaction;

pub use cache::{BatchCache, BatchStatus};
pub use capacity::{CapacityCheck, Correction, CountSnapshot};
pub use config::{DatabaseConfig, EngineConfig, LedgerConfig};
pub use engine::LinkEngine;
pub use error::LedgerError;
pub use import::{GroupLayout, ImportReport, RowError, RowErrorKind, RowRole};
pub use link::{LinkErrorKind, LinkResult, UnlinkResult};
pub use model::{EntityKind, Level, ParentStatus};
pub use pool::ConnectionPool;
pub use store::{LedgerStore, LedgerTx, MemoryLedger, PgLedger};
