//! Metrics and tracing instrumentation.
//!
//! With the `metrics` feature, [`METRICS`] holds OpenTelemetry instruments exported into a
//! private `prometheus` registry; [`LedgerMetrics::render_prometheus`] produces the text
//! exposition for a host's `/metrics` endpoint. With the `tracing` feature,
//! [`tracing_helpers`] supplies the spans and events used throughout the crate.

#[cfg(feature = "metrics")]
pub use self::otel::{LedgerMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<LedgerMetrics> = Lazy::new(LedgerMetrics::init);

    pub struct LedgerMetrics {
        registry: Registry,
        // keeps the reader registered for the lifetime of the instruments
        _provider: SdkMeterProvider,
        link_attempts: Counter<u64>,
        link_latency: Histogram<f64>,
        drift_corrections: Counter<u64>,
        cache_lookups: Counter<u64>,
        import_rows: Counter<u64>,
        query_duration: Histogram<f64>,
        query_errors: Counter<u64>,
        pool_wait: Histogram<f64>,
        connect_duration: Histogram<f64>,
    }

    impl LedgerMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("linkledger");

            let link_attempts = meter
                .u64_counter("linkledger_link_attempts_total")
                .with_description("Online link attempts by level and outcome")
                .build();
            let link_latency = meter
                .f64_histogram("linkledger_link_latency_seconds")
                .with_description("Latency of online link attempts")
                .build();
            let drift_corrections = meter
                .u64_counter("linkledger_drift_corrections_total")
                .with_description("Denormalized counters rewritten to the authoritative count")
                .build();
            let cache_lookups = meter
                .u64_counter("linkledger_cache_lookups_total")
                .with_description("Batch cache lookups by result")
                .build();
            let import_rows = meter
                .u64_counter("linkledger_import_rows_total")
                .with_description("Bulk import rows by result")
                .build();
            let query_duration = meter
                .f64_histogram("linkledger_query_duration_seconds")
                .with_description("Duration of queries")
                .build();
            let query_errors = meter
                .u64_counter("linkledger_query_errors_total")
                .with_description("Statements that returned an error")
                .build();
            let pool_wait = meter
                .f64_histogram("linkledger_pool_wait_seconds")
                .with_description("Time spent waiting for a pooled connection")
                .build();
            let connect_duration = meter
                .f64_histogram("linkledger_connect_seconds")
                .with_description("Time to open a new connection")
                .build();

            Self {
                registry,
                _provider: provider,
                link_attempts,
                link_latency,
                drift_corrections,
                cache_lookups,
                import_rows,
                query_duration,
                query_errors,
                pool_wait,
                connect_duration,
            }
        }

        pub fn record_link(&self, level: &'static str, outcome: &'static str, latency: Duration) {
            let attrs = [KeyValue::new("level", level), KeyValue::new("outcome", outcome)];
            self.link_attempts.add(1, &attrs);
            self.link_latency.record(latency.as_secs_f64(), &attrs);
        }

        pub fn record_drift(&self, level: &'static str) {
            self.drift_corrections.add(1, &[KeyValue::new("level", level)]);
        }

        pub fn record_cache(&self, hit: bool) {
            let result = if hit { "hit" } else { "miss" };
            self.cache_lookups.add(1, &[KeyValue::new("result", result)]);
        }

        pub fn record_import_rows(&self, accepted: u64, rejected: u64) {
            self.import_rows.add(accepted, &[KeyValue::new("result", "accepted")]);
            self.import_rows.add(rejected, &[KeyValue::new("result", "rejected")]);
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors.add(1, &[]);
        }

        pub fn record_pool_wait(&self, waited: Duration) {
            self.pool_wait.record(waited.as_secs_f64(), &[]);
        }

        pub fn record_connect(&self, elapsed: Duration) {
            self.connect_duration.record(elapsed.as_secs_f64(), &[]);
        }

        /// Prometheus text exposition of every instrument above.
        pub fn render_prometheus(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn acquire_connection_span() -> Span {
        info_span!("linkledger.acquire_connection")
    }

    pub fn execute_query_span(query: &str) -> Span {
        // statement text only; parameters never reach the span
        let statement = query.split_whitespace().next().unwrap_or("");
        info_span!("linkledger.execute_query", db.statement = statement, db.query = query)
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("linkledger.begin_transaction")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("linkledger.commit_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("linkledger.rollback_transaction")
    }

    pub fn link_span(level: &'static str, parent_id: i64) -> Span {
        info_span!("linkledger.link", link.level = level, parent_id)
    }

    pub fn unlink_span(level: &'static str) -> Span {
        info_span!("linkledger.unlink", link.level = level)
    }

    pub fn reconcile_span(level: &'static str) -> Span {
        info_span!("linkledger.reconcile", link.level = level)
    }

    pub fn import_span(phase: &'static str) -> Span {
        info_span!("linkledger.import", phase)
    }

    /// Structured event emitted whenever a denormalized counter is rewritten.
    pub fn drift_corrected(level: &'static str, parent_id: i64, before: i64, after: i64) {
        tracing::warn!(
            target: "linkledger::drift",
            link.level = level,
            parent_id,
            before,
            after,
            "denormalized counter corrected"
        );
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_contains_recorded_instruments() {
        METRICS.record_link("unit_to_container", "ok", Duration::from_millis(3));
        METRICS.record_drift("container_to_batch");
        let text = METRICS.render_prometheus();
        assert!(text.contains("linkledger_link_attempts_total"));
        assert!(text.contains("linkledger_drift_corrections_total"));
    }
}
