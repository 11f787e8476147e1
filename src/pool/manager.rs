use crate::connection::connect;
use crate::error::LedgerError;
use crate::executor::{instrumented, Executor};
use crate::pool::config::DatabaseConfig;
use crossbeam_channel::{unbounded, Receiver, Sender};
use may::sync::Semaphore;
use may_postgres::types::ToSql;
use may_postgres::{Client, Row};
use std::cell::Cell;
use std::time::{Duration, Instant};

/// Fixed-size pool of `may_postgres` clients.
///
/// Each checkout holds one semaphore permit, so at most `max_connections` callers hold a
/// client at once and the rest wait (coroutine-aware) up to `pool_timeout_seconds`.
pub struct ConnectionPool {
    url: String,
    size: usize,
    checkout_timeout: Duration,
    permits: Semaphore,
    idle_tx: Sender<Client>,
    idle_rx: Receiver<Client>,
}

impl ConnectionPool {
    /// Open `max_connections` clients against `config.url`.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, LedgerError> {
        let size = config.max_connections.max(1);
        let (idle_tx, idle_rx) = unbounded();
        for _ in 0..size {
            let client = connect(&config.url)?;
            // the receiver lives in `Self`, so the queue cannot be disconnected here
            let _ = idle_tx.send(client);
        }
        log::info!("ledger pool ready with {size} connections");

        Ok(Self {
            url: config.url.clone(),
            size,
            checkout_timeout: Duration::from_secs(config.pool_timeout_seconds),
            permits: Semaphore::new(size),
            idle_tx,
            idle_rx,
        })
    }

    /// Check out a client, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<PooledClient<'_>, LedgerError> {
        let start = Instant::now();
        if !self.permits.wait_timeout(self.checkout_timeout) {
            return Err(LedgerError::PoolTimeout(self.checkout_timeout));
        }

        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_pool_wait(start.elapsed());
        #[cfg(not(feature = "metrics"))]
        let _ = start;

        // a permit guarantees a slot; the slot is empty only after a broken client was discarded
        let client = match self.idle_rx.try_recv() {
            Ok(client) => client,
            Err(_) => match connect(&self.url) {
                Ok(client) => client,
                Err(e) => {
                    self.permits.post();
                    return Err(e.into());
                }
            },
        };

        Ok(PooledClient {
            client: Some(client),
            pool: self,
            broken: Cell::new(false),
        })
    }

    /// Configured number of connections
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of clients currently idle in the queue
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    fn release(&self, client: Client, broken: bool) {
        if broken {
            log::warn!("discarding broken ledger connection; it will be reopened on next checkout");
        } else {
            let _ = self.idle_tx.send(client);
        }
        self.permits.post();
    }
}

/// A checked-out client, returned to the pool on drop.
pub struct PooledClient<'p> {
    client: Option<Client>,
    pool: &'p ConnectionPool,
    broken: Cell<bool>,
}

impl PooledClient<'_> {
    /// Do not return this client to the pool; a fresh one is opened on the next checkout.
    pub fn mark_broken(&self) {
        self.broken.set(true);
    }

    /// The underlying driver client.
    pub fn client(&self) -> Result<&Client, LedgerError> {
        self.client
            .as_ref()
            .ok_or_else(|| LedgerError::Other("pooled client already released".to_string()))
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client, self.broken.get());
        }
    }
}

impl Executor for PooledClient<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError> {
        let client = self.client()?;
        instrumented(query, || client.execute(query, params))
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, LedgerError> {
        let client = self.client()?;
        instrumented(query, || client.query_one(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError> {
        let client = self.client()?;
        instrumented(query, || client.query(query, params))
    }
}
