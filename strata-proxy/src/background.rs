use crate::metrics::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use strata_cache::store::cache_key;
use strata_core::http::RequestHeader;

/// A plugin-originated fetch of the full object behind a ranged or partial
/// response. The request is the user's request with `Range` stripped, so
/// the cache key is identical.
#[derive(Debug)]
pub struct BackgroundRequest {
    pub req: RequestHeader,
    pub fingerprint: String,
}

/// Schedules background fetches and enforces the per-fingerprint
/// single-flight guard so concurrent clients don't stampede the origin.
/// The guard is process-wide (shared across workers); the queue is drained
/// by the owning worker, which runs each entry as a synthetic transaction.
pub struct BackgroundFetcher {
    in_flight: Arc<DashMap<String, ()>>,
    pending: Vec<BackgroundRequest>,
}

impl BackgroundFetcher {
    pub fn new(in_flight: Arc<DashMap<String, ()>>) -> Self {
        Self { in_flight, pending: Vec::new() }
    }

    /// Queue a Range-stripped refetch of `req`'s object. Returns false when
    /// an identical fetch is already in flight anywhere in the process.
    pub fn schedule(&mut self, req: &RequestHeader) -> bool {
        let mut clean = req.clone();
        clean.fields.remove("range");
        clean.fields.remove("if-range");
        let fingerprint = cache_key(&clean.effective_url());
        if self.in_flight.contains_key(&fingerprint) {
            tracing::debug!(url = %clean.effective_url(), "Background fetch already in flight");
            return false;
        }
        self.in_flight.insert(fingerprint.clone(), ());
        metrics().background_fetches_total.inc();
        tracing::debug!(url = %clean.effective_url(), "Background fetch scheduled");
        self.pending.push(BackgroundRequest { req: clean, fingerprint });
        true
    }

    /// Hand the queued requests to the worker for synthetic transactions.
    pub fn take_pending(&mut self) -> Vec<BackgroundRequest> {
        std::mem::take(&mut self.pending)
    }

    /// Release the guard once the synthetic transaction finishes.
    pub fn finish(&self, fingerprint: &str) {
        self.in_flight.remove(fingerprint);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
