//! Connection pool for the PostgreSQL ledger backend.
//!
//! A fixed set of `may_postgres` clients is opened up front. Checkout is gated by a
//! `may` semaphore (coroutine-aware waiting with a timeout); idle clients sit in a
//! `crossbeam-channel` queue.

pub mod config;
pub mod manager;

pub use config::DatabaseConfig;
pub use manager::{ConnectionPool, PooledClient};
