//! Concurrent scan load against one batch.
//!
//! Spawns `LINKLEDGER_STRESS_SCANNERS` coroutines that together scan
//! `LINKLEDGER_STRESS_SCANS` container codes (half of them scanned twice, in random order)
//! into a batch of capacity `LINKLEDGER_STRESS_CAPACITY`, then prints outcome counts and
//! latency percentiles.
//!
//! `LINKLEDGER_STRESS_BACKEND=postgres` runs against the configured database
//! (`config/config.toml` / `LINKLEDGER__DATABASE__URL`); the default is the in-process store.

use linkledger::{
    LedgerConfig, LedgerError, LedgerStore, LinkEngine, LinkResult, MemoryLedger, PgLedger,
};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

struct Options {
    scanners: usize,
    scans: usize,
    capacity: i64,
    postgres: bool,
}

impl Options {
    fn from_env() -> Self {
        Self {
            scanners: env_or("LINKLEDGER_STRESS_SCANNERS", 16),
            scans: env_or("LINKLEDGER_STRESS_SCANS", 2000),
            capacity: env_or("LINKLEDGER_STRESS_CAPACITY", 500),
            postgres: std::env::var("LINKLEDGER_STRESS_BACKEND")
                .map(|backend| backend.eq_ignore_ascii_case("postgres"))
                .unwrap_or(false),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn main() -> Result<(), LedgerError> {
    let options = Options::from_env();
    let config = LedgerConfig::load()?;
    may::config().set_workers(options.scanners.clamp(1, 8));

    if options.postgres {
        let store = PgLedger::connect(&config.database)?;
        store.ensure_schema()?;
        run(LinkEngine::new(store, config.engine)?, &options)
    } else {
        run(LinkEngine::new(MemoryLedger::new(), config.engine)?, &options)
    }
}

fn run<S: LedgerStore + 'static>(engine: LinkEngine<S>, options: &Options) -> Result<(), LedgerError> {
    let engine = Arc::new(engine);
    let run_id = std::process::id();
    let batch = engine.create_batch(&format!("STRESS-B{run_id}"), options.capacity)?;

    let distinct = (options.scans / 2).max(1);
    let mut codes: Vec<String> = (0..options.scans)
        .map(|n| format!("STRESS-{run_id}-{:06}", n % distinct))
        .collect();
    codes.shuffle(&mut thread_rng());

    let per_scanner = codes.len().div_ceil(options.scanners.max(1)).max(1);
    let started = Instant::now();
    let handles: Vec<_> = codes
        .chunks(per_scanner)
        .enumerate()
        .map(|(scanner, chunk)| {
            let engine = Arc::clone(&engine);
            let chunk = chunk.to_vec();
            let batch_id = batch.id;
            may::go!(move || {
                chunk
                    .iter()
                    .map(|code| engine.link_container(batch_id, code, scanner as i64))
                    .collect::<Vec<LinkResult>>()
            })
        })
        .collect();

    let mut results = Vec::with_capacity(options.scans);
    for handle in handles {
        match handle.join() {
            Ok(chunk) => results.extend(chunk),
            Err(_) => return Err(LedgerError::Other("scanner coroutine panicked".to_string())),
        }
    }
    let wall = started.elapsed();

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for result in &results {
        let outcome = result.error_kind.as_ref().map_or("linked", |kind| kind.as_str());
        *outcomes.entry(outcome).or_default() += 1;
    }
    let mut latencies: Vec<f64> = results.iter().map(|result| result.latency_ms).collect();
    latencies.sort_by(f64::total_cmp);

    let status = engine.get_batch_status(batch.id)?;
    println!(
        "{} scans by {} scanners in {:.2}s against batch {} (capacity {})",
        results.len(),
        options.scanners,
        wall.as_secs_f64(),
        batch.code,
        options.capacity
    );
    for (outcome, count) in &outcomes {
        println!("  {outcome:<26} {count}");
    }
    println!(
        "  latency p50 {:.2}ms  p95 {:.2}ms  max {:.2}ms",
        percentile(&latencies, 0.50),
        percentile(&latencies, 0.95),
        latencies.last().copied().unwrap_or(0.0)
    );
    if let Some(status) = status {
        println!("  batch linked {}/{} ({})", status.linked_count, status.capacity, status.status);
        if status.linked_count > status.capacity {
            return Err(LedgerError::Other(format!(
                "batch {} over capacity: {}/{}",
                status.code, status.linked_count, status.capacity
            )));
        }
    }
    Ok(())
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
