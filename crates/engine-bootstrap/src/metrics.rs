//! Process metrics (spec §11 ambient stack "Metrics"), mirroring the
//! teacher's `metrics::register_all()` pattern: one `Registry`, gauges and
//! counters registered once at startup and updated from the relevant loop.

use prometheus::{IntCounter, IntGauge, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub pool_workers_total: IntGauge,
    pub pool_workers_idle: IntGauge,
    pub pool_workers_busy: IntGauge,
    pub queue_depth: IntGauge,
    pub runs_dispatched_total: IntCounter,
    pub runs_failed_total: IntCounter,
    pub log_batches_flushed_total: IntCounter,
    pub log_records_truncated_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let pool_workers_total = IntGauge::new("pool_workers_total", "Total worker processes").unwrap();
        let pool_workers_idle = IntGauge::new("pool_workers_idle", "Idle worker processes").unwrap();
        let pool_workers_busy = IntGauge::new("pool_workers_busy", "Busy worker processes").unwrap();
        let queue_depth = IntGauge::new("dispatch_queue_depth", "Ready-to-dispatch run requests").unwrap();
        let runs_dispatched_total =
            IntCounter::new("runs_dispatched_total", "Runs handed to the pool").unwrap();
        let runs_failed_total = IntCounter::new("runs_failed_total", "Runs that ended non-successfully").unwrap();
        let log_batches_flushed_total =
            IntCounter::new("log_batches_flushed_total", "Log batches persisted by the multiplexer").unwrap();
        let log_records_truncated_total = IntCounter::new(
            "log_records_truncated_total",
            "Runs whose log stream hit the per-run truncation ceiling",
        )
        .unwrap();
        let cache_hits_total = IntCounter::new("module_cache_hits_total", "Module cache hits").unwrap();
        let cache_misses_total = IntCounter::new("module_cache_misses_total", "Module cache misses").unwrap();

        for metric in [
            Box::new(pool_workers_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(pool_workers_idle.clone()),
            Box::new(pool_workers_busy.clone()),
            Box::new(queue_depth.clone()),
            Box::new(runs_dispatched_total.clone()),
            Box::new(runs_failed_total.clone()),
            Box::new(log_batches_flushed_total.clone()),
            Box::new(log_records_truncated_total.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
        ] {
            registry.register(metric).expect("metric names are unique");
        }

        Self {
            registry,
            pool_workers_total,
            pool_workers_idle,
            pool_workers_busy,
            queue_depth,
            runs_dispatched_total,
            runs_failed_total,
            log_batches_flushed_total,
            log_records_truncated_total,
            cache_hits_total,
            cache_misses_total,
        }
    }

    pub fn encode_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("prometheus text encoding");
        String::from_utf8(buf).expect("prometheus output is utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_text_reflects_updated_gauges_and_counters() {
        let metrics = Metrics::new();
        metrics.pool_workers_total.set(3);
        metrics.runs_dispatched_total.inc();
        metrics.runs_dispatched_total.inc();

        let text = metrics.encode_text();
        assert!(text.contains("pool_workers_total 3"));
        assert!(text.contains("runs_dispatched_total 2"));
    }

    #[test]
    fn new_registers_every_collector_without_name_collisions() {
        // Metrics::new() panics on a duplicate registration; constructing
        // two independent registries must not collide with each other.
        let _a = Metrics::new();
        let _b = Metrics::new();
    }
}
