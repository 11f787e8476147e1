//! Short-TTL batch metadata cache.
//!
//! Serves capacity and status reads for dashboards and the batch lookup at the start of
//! an online link. It never takes part in a capacity decision: the capacity ledger always
//! counts links inside the write transaction.

use crate::error::LedgerError;
use crate::model::ParentStatus;
use crate::store::ParentRow;
use may::sync::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Batch metadata as served to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub batch_id: i64,
    pub code: String,
    pub linked_count: i64,
    pub capacity: i64,
    pub status: ParentStatus,
    pub total_weight: Decimal,
}

impl BatchStatus {
    pub(crate) fn from_parent(row: ParentRow) -> Self {
        Self {
            batch_id: row.id,
            code: row.code,
            linked_count: row.counter,
            capacity: row.capacity,
            status: row.status,
            total_weight: row.weight,
        }
    }

    pub fn remaining(&self) -> i64 {
        (self.capacity - self.linked_count).max(0)
    }
}

struct Entry {
    status: BatchStatus,
    loaded_at: Instant,
}

pub struct BatchCache {
    ttl: Duration,
    entries: RwLock<HashMap<i64, Entry>>,
}

impl BatchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached entry younger than the TTL, if any.
    pub fn get(&self, batch_id: i64) -> Option<BatchStatus> {
        let entries = self.entries.read().ok()?;
        entries
            .get(&batch_id)
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| entry.status.clone())
    }

    /// Serve from the cache, or run `loader` and remember what it found.
    ///
    /// A batch the loader does not find is not cached.
    pub fn get_or_load<F>(&self, batch_id: i64, loader: F) -> Result<Option<BatchStatus>, LedgerError>
    where
        F: FnOnce() -> Result<Option<BatchStatus>, LedgerError>,
    {
        if let Some(status) = self.get(batch_id) {
            #[cfg(feature = "metrics")]
            METRICS.record_cache(true);
            return Ok(Some(status));
        }
        #[cfg(feature = "metrics")]
        METRICS.record_cache(false);

        let loaded = loader()?;
        if let Some(status) = &loaded {
            self.insert(status.clone());
        }
        Ok(loaded)
    }

    pub fn insert(&self, status: BatchStatus) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                status.batch_id,
                Entry {
                    status,
                    loaded_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, batch_id: i64) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&batch_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Number of entries held, fresh or expired
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
