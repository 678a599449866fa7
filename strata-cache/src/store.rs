use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use strata_core::config::CacheConfig;
use strata_core::http::{self, RequestHeader, ResponseHeader};
use strata_io::{ChanId, Reactor, ServiceMap};
use thiserror::Error;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    Miss,
    HitFresh,
    HitStale,
    /// Lookup was bypassed (cache disabled, non-GET, request no-cache).
    Skipped,
}

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("another writer holds key {0}")]
    WriterBusy(String),
    #[error("object too large: {0} bytes")]
    TooLarge(u64),
    #[error("cache disabled")]
    Disabled,
}

/// One stored response variant of a URL, addressed by `(key, alt_id)`.
#[derive(Debug, Clone)]
pub struct Alternate {
    pub id: u64,
    pub req: RequestHeader,
    pub resp: ResponseHeader,
    pub body: Bytes,
    pub stored_at_ms: u64,
    pub inserted_seq: u64,
}

impl Alternate {
    pub fn age_secs(&self, now_ms: u64) -> i64 {
        (now_ms.saturating_sub(self.stored_at_ms) / 1000) as i64
    }

    pub fn is_fresh(&self, now_ms: u64, heuristic_ttl: i64) -> bool {
        let lifetime = http::freshness_lifetime_secs(&self.resp).unwrap_or(heuristic_ttl);
        self.age_secs(now_ms) < lifetime
    }
}

/// A lookup candidate handed to SELECT_ALT: the hook may only mutate
/// `quality`.
#[derive(Debug, Clone)]
pub struct AltCandidate {
    pub alt_id: u64,
    pub quality: f32,
    pub inserted_seq: u64,
    pub resp: ResponseHeader,
    pub fresh: bool,
}

#[derive(Debug)]
pub struct CacheLookup {
    pub verdict: CacheVerdict,
    pub key: String,
    pub candidates: Vec<AltCandidate>,
}

/// Exclusive write reservation for one key. Dropping it without commit or
/// abort leaks the reservation, so the state machine always resolves it.
#[derive(Debug)]
pub struct WriteHandle {
    key: String,
    pub alt_req: RequestHeader,
    pub alt_resp: ResponseHeader,
}

impl WriteHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Entry {
    alternates: Vec<Alternate>,
    writer_active: bool,
    scheduled_update_ms: Option<u64>,
}

/// Per-worker in-memory object cache. The single-writer-per-key guarantee
/// is local to the worker, which is exactly the scope the state machine
/// relies on (the data plane is shared-nothing).
pub struct CacheStore {
    config: CacheConfig,
    entries: HashMap<String, Entry>,
    scheduled: HashMap<String, u64>,
    seq: u64,
    next_alt_id: u64,
    /// When set, lookups behave as MISS with no-cache-write.
    outage: bool,
}

pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            scheduled: HashMap::new(),
            seq: 0,
            next_alt_id: 1,
            outage: false,
        }
    }

    pub fn set_outage(&mut self, outage: bool) {
        self.outage = outage;
    }

    pub fn is_available(&self) -> bool {
        self.config.enabled && !self.outage
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the request against stored alternates. `url_override` is the
    /// plugin-set cache URL; when absent the request's effective URL keys
    /// the object.
    pub fn lookup(
        &self,
        req: &RequestHeader,
        url_override: Option<&str>,
        now_ms: u64,
    ) -> CacheLookup {
        let url = url_override.map(str::to_string).unwrap_or_else(|| req.effective_url());
        let key = cache_key(&url);
        if !self.is_available() || req.method != ::http::Method::GET {
            return CacheLookup { verdict: CacheVerdict::Skipped, key, candidates: Vec::new() };
        }
        if let Some(cc) = req.fields.get("cache-control")
            && cc.to_ascii_lowercase().contains("no-cache")
        {
            return CacheLookup { verdict: CacheVerdict::Skipped, key, candidates: Vec::new() };
        }
        let Some(entry) = self.entries.get(&key) else {
            return CacheLookup { verdict: CacheVerdict::Miss, key, candidates: Vec::new() };
        };
        let candidates: Vec<AltCandidate> = entry
            .alternates
            .iter()
            .filter(|alt| vary_matches(req, alt))
            .map(|alt| AltCandidate {
                alt_id: alt.id,
                quality: 1.0,
                inserted_seq: alt.inserted_seq,
                resp: alt.resp.clone(),
                fresh: alt.is_fresh(now_ms, self.config.heuristic_ttl_secs),
            })
            .collect();
        if candidates.is_empty() {
            return CacheLookup { verdict: CacheVerdict::Miss, key, candidates };
        }
        let verdict = if candidates.iter().any(|c| c.fresh) {
            CacheVerdict::HitFresh
        } else {
            CacheVerdict::HitStale
        };
        CacheLookup { verdict, key, candidates }
    }

    pub fn get_alternate(&self, key: &str, alt_id: u64) -> Option<&Alternate> {
        self.entries.get(key)?.alternates.iter().find(|a| a.id == alt_id)
    }

    /// Open a body reader for a stored alternate: a channel pre-loaded with
    /// the object body and EOS armed. Concurrent readers each get their own
    /// channel over the same shared bytes.
    pub fn open_read(&self, rx: &mut Reactor, key: &str, alt_id: u64) -> Option<(ResponseHeader, ChanId, u64)> {
        let alt = self.get_alternate(key, alt_id)?;
        let chan = rx.new_buffered_channel(ServiceMap::new());
        let len = alt.body.len() as u64;
        rx.feed(chan, alt.body.clone());
        rx.feed_eos(chan);
        Some((alt.resp.clone(), chan, len))
    }

    /// Reserve the single writer slot for `key`.
    pub fn open_write(
        &mut self,
        key: &str,
        req: RequestHeader,
        resp: ResponseHeader,
    ) -> Result<WriteHandle, CacheWriteError> {
        if !self.is_available() {
            return Err(CacheWriteError::Disabled);
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            alternates: Vec::new(),
            writer_active: false,
            scheduled_update_ms: None,
        });
        if entry.writer_active {
            return Err(CacheWriteError::WriterBusy(key.to_string()));
        }
        entry.writer_active = true;
        Ok(WriteHandle { key: key.to_string(), alt_req: req, alt_resp: resp })
    }

    /// Finish a write: store the alternate, replacing any variant with the
    /// same vary selector.
    pub fn commit_write(
        &mut self,
        handle: WriteHandle,
        body: Bytes,
        now_ms: u64,
    ) -> Result<u64, CacheWriteError> {
        if body.len() as u64 > self.config.max_object_bytes {
            self.release_writer(&handle.key);
            return Err(CacheWriteError::TooLarge(body.len() as u64));
        }
        self.seq += 1;
        let alt_id = self.next_alt_id;
        self.next_alt_id += 1;
        let alt = Alternate {
            id: alt_id,
            req: handle.alt_req,
            resp: handle.alt_resp,
            body,
            stored_at_ms: now_ms,
            inserted_seq: self.seq,
        };
        let entry = self.entries.get_mut(&handle.key).expect("writer without entry");
        entry.writer_active = false;
        entry.alternates.retain(|existing| !same_variant(existing, &alt));
        tracing::debug!(key = %handle.key, alt = alt_id, bytes = alt.body.len(), "Cache write committed");
        entry.alternates.push(alt);
        Ok(alt_id)
    }

    /// Discard a truncated or abandoned write; the partial alternate is
    /// never visible.
    pub fn abort_write(&mut self, handle: WriteHandle) {
        tracing::debug!(key = %handle.key, "Cache write aborted");
        self.release_writer(&handle.key);
    }

    fn release_writer(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.writer_active = false;
            if entry.alternates.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    pub fn has_active_writer(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.writer_active)
    }

    /// Refresh a revalidated alternate: merge 304 headers and reset age.
    pub fn refresh_alternate(
        &mut self,
        key: &str,
        alt_id: u64,
        not_modified: &ResponseHeader,
        now_ms: u64,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(key) else { return false };
        let Some(alt) = entry.alternates.iter_mut().find(|a| a.id == alt_id) else { return false };
        for (name, value) in not_modified.fields.iter() {
            if !http::is_hop_by_hop(name) {
                alt.resp.fields.set(name, value);
            }
        }
        alt.stored_at_ms = now_ms;
        true
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Register a background revalidation for `url` at `time_ms`.
    pub fn set_schedule_update(&mut self, url: &str, time_ms: u64) {
        self.scheduled.insert(url.to_string(), time_ms);
    }

    /// Pull URLs whose scheduled revalidation time has arrived.
    pub fn take_due_updates(&mut self, now_ms: u64) -> Vec<String> {
        let due: Vec<String> = self
            .scheduled
            .iter()
            .filter(|(_, t)| **t <= now_ms)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &due {
            self.scheduled.remove(url);
        }
        due
    }
}

/// A request matches an alternate when every header the stored response
/// varies on carries the same value the stored request carried.
fn vary_matches(req: &RequestHeader, alt: &Alternate) -> bool {
    let Some(vary) = alt.resp.fields.get("vary") else { return true };
    for name in vary.split(',') {
        let name = name.trim();
        if name == "*" {
            return false;
        }
        if req.fields.get(name) != alt.req.fields.get(name) {
            return false;
        }
    }
    true
}

fn same_variant(a: &Alternate, b: &Alternate) -> bool {
    match (a.resp.fields.get("vary"), b.resp.fields.get("vary")) {
        (None, None) => true,
        (Some(va), Some(vb)) if va == vb => va
            .split(',')
            .map(str::trim)
            .all(|name| a.req.fields.get(name) == b.req.fields.get(name)),
        _ => false,
    }
}
