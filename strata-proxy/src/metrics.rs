use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Proxy-core metrics, registered once per process.
pub struct ProxyMetrics {
    pub registry: Registry,

    /// Transactions by cache verdict (miss, hit_fresh, hit_stale, skipped)
    pub txn_cache_verdict: IntCounterVec,

    /// Responses by status class (2xx..5xx)
    pub responses_total: IntCounterVec,

    pub client_sessions: IntGauge,
    pub pooled_origin_sessions: IntGauge,
    pub origin_connections_total: IntCounter,
    pub origin_shutdown_cleanup_entry: IntCounter,
    pub cache_writes_total: IntCounter,
    pub cache_write_aborts_total: IntCounter,
    pub hook_errors_total: IntCounter,
    pub parent_retries_total: IntCounter,
    pub background_fetches_total: IntCounter,
}

impl ProxyMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let txn_cache_verdict = IntCounterVec::new(
            Opts::new("strata_txn_cache_verdict_total", "Transactions by cache verdict")
                .namespace("strata"),
            &["verdict"],
        )?;
        let responses_total = IntCounterVec::new(
            Opts::new("strata_responses_total", "Responses by status class").namespace("strata"),
            &["class"],
        )?;
        let client_sessions =
            IntGauge::new("strata_client_sessions", "Currently open client sessions")?;
        let pooled_origin_sessions =
            IntGauge::new("strata_pooled_origin_sessions", "Idle origin sessions parked")?;
        let origin_connections_total =
            IntCounter::new("strata_origin_connections_total", "Origin connects attempted")?;
        let origin_shutdown_cleanup_entry = IntCounter::new(
            "strata_origin_shutdown_cleanup_entry_total",
            "Origin channels closed by vc-table cleanup",
        )?;
        let cache_writes_total =
            IntCounter::new("strata_cache_writes_total", "Cache writes committed")?;
        let cache_write_aborts_total =
            IntCounter::new("strata_cache_write_aborts_total", "Cache writes discarded")?;
        let hook_errors_total =
            IntCounter::new("strata_hook_errors_total", "Hook callbacks reporting error")?;
        let parent_retries_total =
            IntCounter::new("strata_parent_retries_total", "Next-hop failovers")?;
        let background_fetches_total =
            IntCounter::new("strata_background_fetches_total", "Background fetches scheduled")?;

        registry.register(Box::new(txn_cache_verdict.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;
        registry.register(Box::new(client_sessions.clone()))?;
        registry.register(Box::new(pooled_origin_sessions.clone()))?;
        registry.register(Box::new(origin_connections_total.clone()))?;
        registry.register(Box::new(origin_shutdown_cleanup_entry.clone()))?;
        registry.register(Box::new(cache_writes_total.clone()))?;
        registry.register(Box::new(cache_write_aborts_total.clone()))?;
        registry.register(Box::new(hook_errors_total.clone()))?;
        registry.register(Box::new(parent_retries_total.clone()))?;
        registry.register(Box::new(background_fetches_total.clone()))?;

        Ok(Self {
            registry,
            txn_cache_verdict,
            responses_total,
            client_sessions,
            pooled_origin_sessions,
            origin_connections_total,
            origin_shutdown_cleanup_entry,
            cache_writes_total,
            cache_write_aborts_total,
            hook_errors_total,
            parent_retries_total,
            background_fetches_total,
        })
    }

    pub fn count_response(&self, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.responses_total.with_label_values(&[class]).inc();
    }
}

static METRICS: Lazy<ProxyMetrics> =
    Lazy::new(|| ProxyMetrics::new().expect("metrics registration"));

pub fn metrics() -> &'static ProxyMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let m = metrics();
        m.txn_cache_verdict.with_label_values(&["miss"]).inc();
        m.count_response(200);
        m.count_response(502);
        assert!(m.responses_total.with_label_values(&["2xx"]).get() >= 1);
        assert!(m.responses_total.with_label_values(&["5xx"]).get() >= 1);
    }
}
