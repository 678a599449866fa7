use crate::metrics::metrics;
use crate::resolver::{HostLookupResult, NextHopSelector, split_host_port};
use crate::server_session::{PoolKey, ServerSession};
use crate::session::{ClientSession, TxnDisposition};
use crate::transform;
use crate::tunnel::{BodySource, Tunnel};
use crate::txn::{ConnectResult, HookInvocation, ProcessCtx, TxnCtx};
use crate::vc_table::{VcRole, VcTable};
use bytes::Bytes;
use ::http::{Method, StatusCode};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use strata_cache::{CacheVerdict, WriteHandle};
use strata_core::ProxyError;
use strata_core::http::{
    self, BodyFraming, RequestHeader, ResponseHeader, request_body_framing, response_body_framing,
};
use strata_hooks::{HookCursor, HookPoint};
use strata_io::buffer::{BUFFER_SIZE_INDEX_4K, BUFFER_SIZE_INDEX_8K};
use strata_io::{
    ChanId, ContId, Continuation, Event, EventData, IoBuffer, IoReader, Reactor, ServiceMap,
    VioId, UNBOUNDED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmState {
    TxnInit,
    ReqParse,
    ReadReqBody,
    Remap,
    CacheLookup,
    DnsLookup,
    OriginConnect,
    SendRequest,
    ReadResponseHdr,
    PrepareResponse,
    StreamBody,
    TxnClose,
    Done,
}

/// Handler tag stored in the VC-table entries; names the state-machine
/// method driving each channel's VIOs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmHandler {
    ClientRead,
    ClientWrite,
    OriginRead,
    OriginWrite,
    CacheRead,
    CacheSinkWrite,
    CollectorRead,
    ChainInput,
}

/// Where the state machine resumes after a hook callout completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterCallout {
    StartReqParse,
    PreRemapHooks,
    DoRemap,
    RouteOnVerdict,
    ServeFromCache,
    Connect,
    WriteRequest,
    ClassifyResponse,
    StartStreaming,
    FinishClose,
}

/// Which store the response body is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespSource {
    Origin,
    Cache,
}

/// Which body form feeds the single cache writer for this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheWriteForm {
    Untransformed,
    Transformed,
}

/// Marker for a callout that must start only after already-queued work
/// (e.g. SELECT_ALT handlers) has run.
struct DeferredCallout(HookPoint, AfterCallout);

/// The per-transaction state machine: parse → remap → cache-lookup →
/// (revalidate | fetch | serve) → transform → respond → close. One
/// instance per request, pinned to its reactor thread for life.
pub struct HttpSM {
    cont: Option<ContId>,
    process: Rc<ProcessCtx>,
    session: Weak<RefCell<ClientSession>>,
    ctx: Rc<RefCell<TxnCtx>>,
    state: SmState,
    vc_table: VcTable<SmHandler>,

    client_chan: ChanId,
    client_buf: IoBuffer,
    client_reader: IoReader,
    client_read_vio: Option<VioId>,
    client_write_vio: Option<VioId>,

    req_body: Option<BodySource>,
    req_body_bytes: Vec<u8>,

    selector: Option<NextHopSelector>,
    resolved: Vec<SocketAddr>,
    addr_cursor: usize,
    connect_token: u64,

    origin: Option<ServerSession>,
    origin_raw_buf: Option<IoBuffer>,
    origin_raw_reader: Option<IoReader>,
    origin_read_vio: Option<VioId>,
    origin_write_vio: Option<VioId>,
    origin_from_pool: bool,

    resp_source: RespSource,
    cache_key: Option<String>,
    cache_write: Option<WriteHandle>,
    cache_write_form: Option<CacheWriteForm>,
    cache_sink_chan: Option<ChanId>,
    cache_sink_vio: Option<VioId>,
    cache_capture: Option<IoReader>,
    reval_alt: Option<u64>,
    served_alt: Option<u64>,

    tunnel: Option<Tunnel>,
    collector_read_vio: Option<VioId>,

    callout: Option<(HookPoint, HookCursor, AfterCallout)>,
    pending_disposition: TxnDisposition,
    error_disposition: TxnDisposition,
    response_sent_status: Option<u16>,
    request_body_complete: bool,
    client_aborted: bool,
    /// Latched origin EOS: it can arrive while the machine is suspended in
    /// a hook callout, before the tunnel exists.
    origin_eos_seen: bool,
    terminated: bool,
}

impl HttpSM {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        rx: &mut Reactor,
        process: Rc<ProcessCtx>,
        session: Weak<RefCell<ClientSession>>,
        client_chan: ChanId,
        client_buf: IoBuffer,
        client_reader: IoReader,
        txn_id: u64,
        client_addr: Option<SocketAddr>,
    ) -> Rc<RefCell<HttpSM>> {
        let ctx = Rc::new(RefCell::new(TxnCtx::new(txn_id, client_addr)));
        ctx.borrow_mut().milestones.txn_start = rx.now_ms();
        let sm = Rc::new(RefCell::new(HttpSM {
            cont: None,
            process,
            session,
            ctx,
            state: SmState::TxnInit,
            vc_table: VcTable::new(),
            client_chan,
            client_buf,
            client_reader,
            client_read_vio: None,
            client_write_vio: None,
            req_body: None,
            req_body_bytes: Vec::new(),
            selector: None,
            resolved: Vec::new(),
            addr_cursor: 0,
            connect_token: 0,
            origin: None,
            origin_raw_buf: None,
            origin_raw_reader: None,
            origin_read_vio: None,
            origin_write_vio: None,
            origin_from_pool: false,
            resp_source: RespSource::Origin,
            cache_key: None,
            cache_write: None,
            cache_write_form: None,
            cache_sink_chan: None,
            cache_sink_vio: None,
            cache_capture: None,
            reval_alt: None,
            served_alt: None,
            tunnel: None,
            collector_read_vio: None,
            callout: None,
            pending_disposition: TxnDisposition::Close,
            error_disposition: TxnDisposition::Close,
            response_sent_status: None,
            request_body_complete: false,
            client_aborted: false,
            origin_eos_seen: false,
            terminated: false,
        }));
        let cont = rx.register_cont(sm.clone());
        {
            let mut this = sm.borrow_mut();
            this.cont = Some(cont);
            let entry = this.vc_table.new_entry();
            entry.chan = Some(client_chan);
            entry.role = VcRole::Client;
            entry.read_handler = Some(SmHandler::ClientRead);
            entry.write_handler = Some(SmHandler::ClientWrite);
        }
        // Start on the next dispatch: the spawner (the session, mid release
        // of the previous transaction) must unwind first.
        rx.schedule(cont, Event::Immediate, EventData::None);
        sm
    }

    fn cont(&self) -> ContId {
        self.cont.expect("state machine without cont id")
    }

    // ── Hook callouts ─────────────────────────────────────────────

    fn do_api_callout(&mut self, rx: &mut Reactor, point: HookPoint, after: AfterCallout) {
        let cursor = {
            let ctx = self.ctx.borrow();
            HookCursor::build(point, &ctx.txn_hooks, &self.process.global_hooks.borrow())
        };
        self.ctx.borrow_mut().hook_stats.added += cursor.remaining();
        self.callout = Some((point, cursor, after));
        self.advance_callout(rx);
    }

    fn advance_callout(&mut self, rx: &mut Reactor) {
        let (point, next, after) = match &mut self.callout {
            Some((point, cursor, after)) => (*point, cursor.next(), *after),
            None => return,
        };
        if let Some(next) = next {
            let invocation = HookInvocation::for_txn(point, self.cont(), Rc::clone(&self.ctx));
            rx.cont_call(next, Event::Immediate, EventData::Opaque(Rc::new(invocation)));
            return;
        }
        self.callout = None;
        self.proceed(rx, after);
    }

    fn on_hook_error(&mut self, rx: &mut Reactor) {
        metrics().hook_errors_total.inc();
        let status = self.ctx.borrow().hook_error_status;
        // Continuations behind the failing one never run; keep the
        // added/fired ledger balanced.
        if let Some((_, cursor, _)) = &self.callout {
            self.ctx.borrow_mut().hook_stats.added -= cursor.remaining();
        }
        self.callout = None;
        tracing::debug!(status = status, "Hook short-circuited transaction");
        self.send_error(rx, status);
    }

    fn proceed(&mut self, rx: &mut Reactor, after: AfterCallout) {
        match after {
            AfterCallout::StartReqParse => self.start_req_parse(rx),
            AfterCallout::PreRemapHooks => {
                self.do_api_callout(rx, HookPoint::ReadRequestPreRemap, AfterCallout::DoRemap)
            }
            AfterCallout::DoRemap => self.do_remap(rx),
            AfterCallout::RouteOnVerdict => self.route_on_verdict(rx),
            AfterCallout::ServeFromCache => self.serve_from_cache(rx),
            AfterCallout::Connect => self.connect_next_addr(rx),
            AfterCallout::WriteRequest => self.write_origin_request(rx),
            AfterCallout::ClassifyResponse => self.classify_response(rx),
            AfterCallout::StartStreaming => self.start_streaming(rx),
            AfterCallout::FinishClose => self.finish_close(rx),
        }
    }

    // ── Request parse ─────────────────────────────────────────────

    fn start_req_parse(&mut self, rx: &mut Reactor) {
        self.state = SmState::ReqParse;
        let vio = rx.do_io_read(self.client_chan, self.cont(), UNBOUNDED, self.client_buf.clone());
        self.client_read_vio = Some(vio);
        if let Some(entry) = self.vc_table.find_entry(self.client_chan) {
            entry.read_vio = Some(vio);
        }
        rx.set_inactivity_timeout(self.client_chan, self.process.config.proxy.inactivity_timeout_ms);
        if self.process.config.proxy.active_timeout_ms > 0 {
            rx.set_active_timeout(self.client_chan, self.process.config.proxy.active_timeout_ms);
        }
        self.try_parse_request(rx);
    }

    fn try_parse_request(&mut self, rx: &mut Reactor) {
        let avail = self.client_reader.read_avail();
        if avail == 0 {
            if let Some(vio) = self.client_read_vio {
                rx.reenable(vio);
            }
            return;
        }
        let mut data = vec![0u8; avail];
        self.client_reader.copy_out(&mut data);
        match RequestHeader::parse(&data) {
            Ok(Some((req, len))) => {
                self.client_reader.consume(len);
                tracing::debug!(method = %req.method, target = %req.target, "Request parsed");
                {
                    let mut ctx = self.ctx.borrow_mut();
                    ctx.milestones.request_parsed = rx.now_ms();
                    ctx.client_req = Some(req);
                }
                self.state = SmState::ReadReqBody;
                self.do_api_callout(rx, HookPoint::ReadRequestHdr, AfterCallout::PreRemapHooks);
            }
            Ok(None) => {
                if let Some(vio) = self.client_read_vio {
                    rx.reenable(vio);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, tag = e.tag(), "Request parse failed");
                self.send_error(rx, 400);
            }
        }
    }

    // ── Request body (buffered before connect so failover can replay) ──

    fn read_request_body(&mut self, rx: &mut Reactor) -> bool {
        let framing = {
            let ctx = self.ctx.borrow();
            request_body_framing(ctx.client_req.as_ref().expect("request parsed"))
        };
        if matches!(framing, BodyFraming::None) {
            self.request_body_complete = true;
            return true;
        }
        if self.req_body.is_none() {
            self.req_body = Some(BodySource::new(framing, self.client_reader.clone()));
        }
        self.pump_request_body(rx)
    }

    fn pump_request_body(&mut self, rx: &mut Reactor) -> bool {
        let Some(body) = &mut self.req_body else { return true };
        match body.pump() {
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Request body framing error");
                self.send_error(rx, 400);
                return false;
            }
        }
        let out_reader = body.out.alloc_reader();
        let fresh = out_reader.read_all();
        self.req_body_bytes.extend_from_slice(&fresh);
        if body.done {
            self.request_body_complete = true;
            return true;
        }
        if let Some(vio) = self.client_read_vio {
            rx.reenable(vio);
        }
        false
    }

    // ── Remap ─────────────────────────────────────────────────────

    fn do_remap(&mut self, rx: &mut Reactor) {
        self.state = SmState::Remap;
        {
            let mut ctx = self.ctx.borrow_mut();
            if !ctx.skip_remap {
                let rules = &self.process.config.remap;
                if let Some(req) = ctx.client_req.as_mut() {
                    let url = req.effective_url();
                    for rule in rules {
                        if let Some(rest) = url.strip_prefix(&rule.from) {
                            let new_url = format!("{}{}", rule.to, rest);
                            tracing::debug!(from = %url, to = %new_url, "Remapped");
                            req.target = new_url;
                            req.fields.remove("host");
                            break;
                        }
                    }
                }
            }
        }
        // The request body must be on hand before the origin leg so a
        // parent failover can replay it.
        if self.read_request_body(rx) {
            self.do_cache_lookup(rx);
        }
    }

    // ── Cache lookup & alternate selection ────────────────────────

    fn do_cache_lookup(&mut self, rx: &mut Reactor) {
        self.state = SmState::CacheLookup;
        let lookup = {
            let ctx = self.ctx.borrow();
            let req = ctx.client_req.as_ref().expect("request parsed");
            self.process.cache.borrow().lookup(req, ctx.cache_url_override.as_deref(), rx.now_ms())
        };
        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.milestones.cache_lookup_done = rx.now_ms();
            ctx.cache_verdict = Some(lookup.verdict);
            ctx.alt_candidates = lookup.candidates;
        }
        self.cache_write = None;
        self.cache_key = Some(lookup.key);
        // The client goes quiet while we work the cache/origin side; only
        // byte flow should gate it from here.
        rx.cancel_inactivity_timeout(self.client_chan);
        let verdict_label = match lookup.verdict {
            CacheVerdict::Miss => "miss",
            CacheVerdict::HitFresh => "hit_fresh",
            CacheVerdict::HitStale => "hit_stale",
            CacheVerdict::Skipped => "skipped",
        };
        metrics().txn_cache_verdict.with_label_values(&[verdict_label]).inc();

        // SELECT_ALT: synchronous, global scope only, quality-mutating.
        let n_candidates = self.ctx.borrow().alt_candidates.len();
        if n_candidates > 1 {
            let handlers: Vec<ContId> = self
                .process
                .global_hooks
                .borrow()
                .get(HookPoint::SelectAlt)
                .iter()
                .filter(|e| !e.no_callback)
                .map(|e| e.cont)
                .collect();
            let count = handlers.len();
            for cont in handlers {
                let invocation = HookInvocation::synchronous(HookPoint::SelectAlt, Rc::clone(&self.ctx));
                rx.schedule(cont, Event::Immediate, EventData::Opaque(Rc::new(invocation)));
            }
            let mut ctx = self.ctx.borrow_mut();
            ctx.hook_stats.added += count;
            ctx.hook_stats.fired += count;
        }
        // Deferred so the SELECT_ALT handlers queued above mutate the
        // candidate qualities before the verdict is acted on.
        let cont = self.cont();
        rx.schedule(
            cont,
            Event::Immediate,
            EventData::Opaque(Rc::new(DeferredCallout(
                HookPoint::CacheLookupComplete,
                AfterCallout::RouteOnVerdict,
            ))),
        );
    }

    fn best_alternate(&self) -> Option<u64> {
        let ctx = self.ctx.borrow();
        ctx.alt_candidates
            .iter()
            .filter(|c| c.quality > 0.0)
            .max_by(|a, b| {
                a.quality
                    .partial_cmp(&b.quality)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.inserted_seq.cmp(&b.inserted_seq))
            })
            .map(|c| c.alt_id)
    }

    fn route_on_verdict(&mut self, rx: &mut Reactor) {
        let verdict = self.ctx.borrow().cache_verdict.expect("verdict set");
        match verdict {
            CacheVerdict::HitFresh => match self.best_alternate() {
                Some(alt) => {
                    self.served_alt = Some(alt);
                    self.load_cached_header(rx, alt);
                }
                // Every alternate was voted out; treat as a miss.
                None => self.begin_origin_leg(rx),
            },
            CacheVerdict::HitStale => {
                self.reval_alt = self.best_alternate();
                self.begin_origin_leg(rx);
            }
            CacheVerdict::Miss | CacheVerdict::Skipped => self.begin_origin_leg(rx),
        }
    }

    fn load_cached_header(&mut self, rx: &mut Reactor, alt: u64) {
        let key = self.cache_key.clone().expect("cache key");
        let cached = {
            let cache = self.process.cache.borrow();
            cache.get_alternate(&key, alt).map(|a| (a.req.clone(), a.resp.clone()))
        };
        match cached {
            Some((req, resp)) => {
                {
                    let mut ctx = self.ctx.borrow_mut();
                    ctx.cached_req = Some(req);
                    ctx.cached_resp = Some(resp);
                }
                self.resp_source = RespSource::Cache;
                self.do_api_callout(rx, HookPoint::ReadCacheHdr, AfterCallout::ServeFromCache);
            }
            None => self.begin_origin_leg(rx),
        }
    }

    fn serve_from_cache(&mut self, rx: &mut Reactor) {
        let key = self.cache_key.clone().expect("cache key");
        let alt = self.served_alt.expect("alternate selected");
        let opened = self.process.cache.borrow().open_read(rx, &key, alt);
        let Some((resp, chan, len)) = opened else {
            // The alternate vanished under us: transparent degrade to origin.
            self.resp_source = RespSource::Origin;
            self.begin_origin_leg(rx);
            return;
        };
        let raw_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
        let raw_reader = raw_buf.alloc_reader();
        let vio = rx.do_io_read(chan, self.cont(), len, raw_buf.clone());
        {
            let entry = self.vc_table.new_entry();
            entry.chan = Some(chan);
            entry.role = VcRole::CacheRead;
            entry.read_vio = Some(vio);
            entry.read_buf = Some(raw_buf.clone());
            entry.read_handler = Some(SmHandler::CacheRead);
        }
        self.origin_raw_buf = Some(raw_buf);
        self.origin_raw_reader = Some(raw_reader);
        self.origin_read_vio = Some(vio);
        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.server_resp = None;
            ctx.cached_resp = Some(resp);
        }
        self.prepare_response(rx);
    }

    // ── Origin leg: DNS → connect → send → read ───────────────────

    fn begin_origin_leg(&mut self, rx: &mut Reactor) {
        self.state = SmState::DnsLookup;
        self.resp_source = RespSource::Origin;
        let (host, port, parents, parent_override) = {
            let ctx = self.ctx.borrow();
            let req = ctx.client_req.as_ref().expect("request parsed");
            let host_port = req.host().unwrap_or("");
            let (host, port) = split_host_port(host_port)
                .unwrap_or_else(|| (host_port.to_string(), 80));
            (host, port, self.process.config.parents.clone(), ctx.parent_override.clone())
        };
        if host.is_empty() {
            self.send_error(rx, 400);
            return;
        }
        let selector = NextHopSelector::new(&host, port, &parents, parent_override);
        let Some((hop_host, hop_port)) = selector.current().cloned() else {
            self.send_error(rx, 502);
            return;
        };
        self.selector = Some(selector);
        self.connect_token += 1;
        let token = self.connect_token;
        let cont = self.cont();
        self.process.resolver.resolve(rx, cont, &hop_host, hop_port, token);
    }

    fn on_host_lookup(&mut self, rx: &mut Reactor, result: Rc<HostLookupResult>) {
        if result.token != self.connect_token {
            return;
        }
        self.ctx.borrow_mut().milestones.dns_done = rx.now_ms();
        if result.addrs.is_empty() {
            self.next_hop_or_fail(rx);
            return;
        }
        self.resolved = result.addrs.clone();
        self.addr_cursor = 0;
        self.ctx.borrow_mut().next_hop_addr = Some(self.resolved[0]);
        self.do_api_callout(rx, HookPoint::OsDns, AfterCallout::Connect);
    }

    fn next_hop_or_fail(&mut self, rx: &mut Reactor) {
        let next = self.selector.as_mut().and_then(|s| s.advance().cloned());
        match next {
            Some((host, port)) => {
                metrics().parent_retries_total.inc();
                tracing::debug!(parent = %host, port = port, "Trying next hop");
                self.connect_token += 1;
                let token = self.connect_token;
                let cont = self.cont();
                self.process.resolver.resolve(rx, cont, &host, port, token);
            }
            None => {
                tracing::warn!("Next hops exhausted");
                self.send_error(rx, 502);
            }
        }
    }

    fn connect_next_addr(&mut self, rx: &mut Reactor) {
        self.state = SmState::OriginConnect;
        if self.addr_cursor >= self.resolved.len() {
            self.next_hop_or_fail(rx);
            return;
        }
        let addr = self.resolved[self.addr_cursor];
        let key = PoolKey::http1(addr);
        let acquired = self.process.pool.borrow_mut().acquire(rx, &key);
        if let Some(session) = acquired {
            self.origin_from_pool = true;
            self.attach_origin(rx, session);
            return;
        }
        metrics().origin_connections_total.inc();
        self.connect_token += 1;
        let token = self.connect_token;
        let cont = self.cont();
        self.process.connector.borrow_mut().connect(rx, addr, cont, token);
    }

    fn on_connect_done(&mut self, rx: &mut Reactor, result: Rc<ConnectResult>) {
        if result.token != self.connect_token {
            return;
        }
        match result.chan {
            Some(chan) => {
                let addr = self.resolved[self.addr_cursor];
                self.origin_from_pool = false;
                self.attach_origin(rx, ServerSession::new(chan, PoolKey::http1(addr)));
            }
            None => {
                tracing::debug!(error = ?result.error, "Origin connect failed");
                self.addr_cursor += 1;
                self.connect_next_addr(rx);
            }
        }
    }

    fn attach_origin(&mut self, rx: &mut Reactor, session: ServerSession) {
        let addr = session.key.addr;
        let chan = session.chan;
        self.origin = Some(session);
        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.server_addr = Some(addr);
            ctx.milestones.origin_connected = rx.now_ms();
        }
        let entry = self.vc_table.new_entry();
        entry.chan = Some(chan);
        entry.role = VcRole::Origin;
        entry.read_handler = Some(SmHandler::OriginRead);
        entry.write_handler = Some(SmHandler::OriginWrite);
        self.do_api_callout(rx, HookPoint::SendRequestHdr, AfterCallout::WriteRequest);
    }

    fn build_server_request(&self) -> RequestHeader {
        let ctx = self.ctx.borrow();
        let req = ctx.client_req.as_ref().expect("request parsed");
        let via_parent = self.selector.as_ref().is_some_and(|s| s.via_parent());
        let mut server_req = req.clone();
        let host = req.host().unwrap_or("").to_string();
        server_req.strip_hop_by_hop();
        if via_parent {
            // Parents need the absolute-form target.
            server_req.target = req.effective_url();
        } else {
            server_req.target = req.path().to_string();
        }
        server_req.fields.set("host", host);
        if !self.req_body_bytes.is_empty() {
            server_req.fields.set("content-length", self.req_body_bytes.len().to_string());
        } else {
            server_req.fields.remove("content-length");
        }
        // Conditional revalidation of a stale alternate.
        if let (Some(alt), Some(key)) = (self.reval_alt, self.cache_key.as_ref()) {
            let cache = self.process.cache.borrow();
            if let Some(stored) = cache.get_alternate(key, alt) {
                if let Some(etag) = stored.resp.etag() {
                    server_req.fields.set("if-none-match", etag);
                }
                if let Some(lm) = stored.resp.fields.get("last-modified") {
                    server_req.fields.set("if-modified-since", lm);
                }
            }
        }
        server_req
    }

    fn write_origin_request(&mut self, rx: &mut Reactor) {
        self.state = SmState::SendRequest;
        let server_req = self.build_server_request();
        let origin_chan = self.origin.as_ref().expect("origin attached").chan;
        let mut wire = server_req.to_bytes();
        wire.extend_from_slice(&self.req_body_bytes);
        self.ctx.borrow_mut().server_req = Some(server_req);

        let out_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
        let reader = out_buf.alloc_reader();
        let total = wire.len() as u64;
        out_buf.write(&wire);
        let wvio = rx.do_io_write(origin_chan, self.cont(), total, reader);
        self.origin_write_vio = Some(wvio);

        let raw_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
        let raw_reader = raw_buf.alloc_reader();
        let rvio = rx.do_io_read(origin_chan, self.cont(), UNBOUNDED, raw_buf.clone());
        self.origin_read_vio = Some(rvio);
        self.origin_raw_buf = Some(raw_buf.clone());
        self.origin_raw_reader = Some(raw_reader);
        if let Some(entry) = self.vc_table.find_entry(origin_chan) {
            entry.write_vio = Some(wvio);
            entry.read_vio = Some(rvio);
            entry.write_buf = Some(out_buf);
            entry.read_buf = Some(raw_buf);
        }
        rx.set_inactivity_timeout(origin_chan, self.process.config.origin.inactivity_timeout_ms);
        self.state = SmState::ReadResponseHdr;
    }

    fn try_parse_response(&mut self, rx: &mut Reactor) {
        let Some(reader) = self.origin_raw_reader.clone() else { return };
        let avail = reader.read_avail();
        if avail == 0 {
            if let Some(vio) = self.origin_read_vio {
                rx.reenable(vio);
            }
            return;
        }
        let mut data = vec![0u8; avail];
        reader.copy_out(&mut data);
        match ResponseHeader::parse(&data) {
            Ok(Some((resp, len))) => {
                reader.consume(len);
                if resp.status.is_informational() {
                    // 1xx interim: swallow and keep reading.
                    self.try_parse_response(rx);
                    return;
                }
                tracing::debug!(status = %resp.status, "Origin response header");
                {
                    let mut ctx = self.ctx.borrow_mut();
                    ctx.milestones.origin_first_byte = rx.now_ms();
                    ctx.server_resp = Some(resp);
                }
                self.do_api_callout(rx, HookPoint::ReadResponseHdr, AfterCallout::ClassifyResponse);
            }
            Ok(None) => {
                if let Some(vio) = self.origin_read_vio {
                    rx.reenable(vio);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Origin response parse failed");
                self.origin_failed(rx);
            }
        }
    }

    /// An origin-path network failure before the response was committed is
    /// retriable against the next hop.
    fn origin_failed(&mut self, rx: &mut Reactor) {
        self.teardown_origin(rx, false);
        if self.response_sent_status.is_none() && self.state != SmState::StreamBody {
            self.next_hop_or_fail(rx);
        }
    }

    fn classify_response(&mut self, rx: &mut Reactor) {
        let status = {
            let ctx = self.ctx.borrow();
            ctx.server_resp.as_ref().expect("response parsed").status
        };
        // 304 against our conditional: serve the refreshed cache object.
        if status == StatusCode::NOT_MODIFIED
            && let Some(alt) = self.reval_alt
        {
            let key = self.cache_key.clone().expect("cache key");
            {
                let resp = self.ctx.borrow().server_resp.clone().expect("response parsed");
                self.process.cache.borrow_mut().refresh_alternate(&key, alt, &resp, rx.now_ms());
            }
            tracing::debug!("Revalidation: 304, serving refreshed cache object");
            self.finish_origin_exchange(rx);
            self.served_alt = Some(alt);
            self.load_cached_header(rx, alt);
            return;
        }
        // 5xx from a parent proxy: fail over to the next one (exhaustion
        // surfaces as 502 inside next_hop_or_fail).
        let via_parent = self.selector.as_ref().is_some_and(|s| s.via_parent());
        if via_parent && status.is_server_error() {
            tracing::debug!(status = %status, "Parent answered 5xx");
            self.ctx.borrow_mut().server_resp = None;
            self.teardown_origin(rx, false);
            self.next_hop_or_fail(rx);
            return;
        }
        self.prepare_response(rx);
    }

    /// The origin answered 304 and the body will come from cache: close out
    /// the origin exchange (reuse the connection if possible).
    fn finish_origin_exchange(&mut self, rx: &mut Reactor) {
        let keep = {
            let ctx = self.ctx.borrow();
            ctx.server_resp.as_ref().map(|r| r.keep_alive()).unwrap_or(false)
        };
        self.teardown_origin(rx, keep);
    }

    fn teardown_origin(&mut self, rx: &mut Reactor, reuse: bool) {
        self.origin_read_vio = None;
        self.origin_write_vio = None;
        self.origin_raw_buf = None;
        self.origin_raw_reader = None;
        if let Some(session) = self.origin.take() {
            let chan = session.chan;
            if reuse && rx.is_chan_open(chan) {
                rx.cancel_inactivity_timeout(chan);
                self.vc_table.remove_entry(chan);
                self.process.pool.borrow_mut().release(rx, session);
            } else {
                metrics().origin_shutdown_cleanup_entry.inc();
                self.vc_table.cleanup_entry(rx, chan);
            }
        }
    }

    // ── Response preparation: cacheability, transforms, headers ───

    fn prepare_response(&mut self, rx: &mut Reactor) {
        self.state = SmState::PrepareResponse;
        self.decide_cache_write(rx);
        self.build_client_response();
        self.do_api_callout(rx, HookPoint::SendResponseHdr, AfterCallout::StartStreaming);
    }

    fn decide_cache_write(&mut self, _rx: &mut Reactor) {
        if self.resp_source == RespSource::Cache {
            return;
        }
        let (cacheable, transformed_wanted, untransformed_wanted, has_transforms) = {
            let ctx = self.ctx.borrow();
            let req = ctx.client_req.as_ref().expect("request parsed");
            let resp = ctx.server_resp.as_ref().expect("response parsed");
            let verdict_allows = matches!(
                ctx.cache_verdict,
                Some(CacheVerdict::Miss) | Some(CacheVerdict::HitStale)
            );
            (
                verdict_allows && !ctx.no_cache_write && http::is_cacheable_response(&req.method, resp),
                ctx.cache_transformed,
                ctx.cache_untransformed,
                !ctx.transforms.is_empty(),
            )
        };
        if !cacheable {
            return;
        }
        // One writer per key: when both forms are requested the transformed
        // one (the alternate the client actually saw) wins the slot.
        let form = if has_transforms {
            if transformed_wanted {
                Some(CacheWriteForm::Transformed)
            } else if untransformed_wanted {
                Some(CacheWriteForm::Untransformed)
            } else {
                None
            }
        } else if untransformed_wanted {
            Some(CacheWriteForm::Untransformed)
        } else {
            None
        };
        let Some(form) = form else { return };
        let key = self.cache_key.clone().expect("cache key");
        let (req, resp) = {
            let ctx = self.ctx.borrow();
            (
                ctx.client_req.clone().expect("request parsed"),
                ctx.server_resp.clone().expect("response parsed"),
            )
        };
        match self.process.cache.borrow_mut().open_write(&key, req, resp) {
            Ok(handle) => {
                self.cache_write = Some(handle);
                self.cache_write_form = Some(form);
            }
            Err(e) => {
                // Cache errors are local; the client never sees them.
                tracing::debug!(error = %e, "Cache write unavailable");
            }
        }
    }

    fn build_client_response(&mut self) {
        let mut ctx = self.ctx.borrow_mut();
        let source = match self.resp_source {
            RespSource::Origin => ctx.server_resp.clone(),
            RespSource::Cache => ctx.cached_resp.clone(),
        };
        let mut resp = source.expect("response source set");
        resp.strip_hop_by_hop();

        // A fresh hit against the client's own validator needs no body.
        let client_inm = ctx
            .client_req
            .as_ref()
            .and_then(|r| r.fields.get("if-none-match"))
            .map(str::to_string);
        let validator_match = match (&client_inm, resp.etag()) {
            (Some(inm), Some(etag)) => http::if_none_match_matches(inm, etag),
            _ => false,
        };
        if self.resp_source == RespSource::Cache && validator_match {
            let mut not_modified = ResponseHeader::new(StatusCode::NOT_MODIFIED);
            for name in ["etag", "cache-control", "expires", "date", "vary", "last-modified"] {
                if let Some(value) = resp.fields.get(name) {
                    not_modified.fields.set(name, value.to_string());
                }
            }
            let keep = ctx.client_req.as_ref().map(|r| r.keep_alive()).unwrap_or(false);
            not_modified
                .fields
                .set("connection", if keep { "keep-alive" } else { "close" });
            ctx.client_resp = Some(not_modified);
            return;
        }
        let has_transforms = !ctx.transforms.is_empty();
        let req_keep_alive = ctx.client_req.as_ref().map(|r| r.keep_alive()).unwrap_or(false);
        let body_len_known = match self.resp_source {
            RespSource::Cache => true,
            RespSource::Origin => {
                let method = ctx.client_req.as_ref().map(|r| r.method.clone()).unwrap_or(Method::GET);
                matches!(
                    response_body_framing(&method, ctx.server_resp.as_ref().expect("response parsed")),
                    BodyFraming::ContentLength(_) | BodyFraming::None
                )
            }
        };
        if has_transforms || !body_len_known {
            // Transformed or unsized bodies go out close-delimited.
            resp.fields.remove("content-length");
            resp.fields.set("connection", "close");
        } else if req_keep_alive {
            resp.fields.set("connection", "keep-alive");
        } else {
            resp.fields.set("connection", "close");
        }
        ctx.client_resp = Some(resp);
    }

    /// Deferred cacheability recheck for partial responses, plus any
    /// plugin-requested refetch: runs after SEND_RESPONSE_HDR hooks so
    /// plugins have had their chance to rewrite the response.
    fn maybe_background_fetch(&mut self) {
        let (was_partial, plugin_asked, req) = {
            let ctx = self.ctx.borrow();
            let partial = ctx
                .server_resp
                .as_ref()
                .map(|r| r.status == StatusCode::PARTIAL_CONTENT)
                .unwrap_or(false);
            (partial, ctx.background_fetch_requested, ctx.client_req.clone())
        };
        let Some(req) = req else { return };
        let mut schedule = plugin_asked;
        if was_partial {
            let ctx = self.ctx.borrow();
            let mut as_full = ctx.server_resp.clone().expect("response parsed");
            as_full.status = StatusCode::OK;
            if http::is_cacheable_response(&req.method, &as_full) {
                schedule = true;
            }
        }
        if schedule {
            self.process.background.borrow_mut().schedule(&req);
        }
    }

    // ── Body streaming ────────────────────────────────────────────

    fn start_streaming(&mut self, rx: &mut Reactor) {
        self.state = SmState::StreamBody;
        self.maybe_background_fetch();

        let framing = {
            let ctx = self.ctx.borrow();
            let method = ctx.client_req.as_ref().map(|r| r.method.clone()).unwrap_or(Method::GET);
            let suppressed = ctx
                .client_resp
                .as_ref()
                .map(|r| r.status == StatusCode::NOT_MODIFIED)
                .unwrap_or(false);
            if suppressed {
                BodyFraming::None
            } else {
                match self.resp_source {
                    RespSource::Origin => {
                        response_body_framing(&method, ctx.server_resp.as_ref().expect("response parsed"))
                    }
                    RespSource::Cache => {
                        let len = self
                            .origin_raw_reader
                            .as_ref()
                            .map(|r| r.read_avail() as u64)
                            .unwrap_or(0);
                        let vio_len = self.origin_read_vio.map(|v| rx.vio_nbytes(v)).unwrap_or(len);
                        if method == Method::HEAD { BodyFraming::None } else { BodyFraming::ContentLength(vio_len) }
                    }
                }
            }
        };
        let raw_reader = self.origin_raw_reader.clone().expect("raw response reader");
        let source = BodySource::new(framing, raw_reader);

        // Untransformed capture reads the identity body.
        let untransformed_capture = (self.cache_write_form == Some(CacheWriteForm::Untransformed))
            .then(|| source.out.alloc_reader());

        // Transform chain.
        let chain = transform::build_chain(rx, &self.ctx);
        let (chain_input_vio, body_out_reader, transformed_capture) = match chain {
            Some((first, collector)) => {
                let input_reader = source.out.alloc_reader();
                let cvio = rx.do_io_write(first, self.cont(), UNBOUNDED, input_reader);
                {
                    let entry = self.vc_table.new_entry();
                    entry.chan = Some(first);
                    entry.role = VcRole::Transform;
                    entry.write_vio = Some(cvio);
                    entry.write_handler = Some(SmHandler::ChainInput);
                    entry.in_tunnel = true;
                }
                let out_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
                let out_reader = out_buf.alloc_reader();
                let capture = (self.cache_write_form == Some(CacheWriteForm::Transformed))
                    .then(|| out_buf.alloc_reader());
                let rvio = rx.do_io_read(collector, self.cont(), UNBOUNDED, out_buf);
                self.collector_read_vio = Some(rvio);
                (Some(cvio), out_reader, capture)
            }
            None => {
                let out_reader = source.out.alloc_reader();
                let capture = (self.cache_write_form == Some(CacheWriteForm::Transformed))
                    .then(|| source.out.alloc_reader());
                (None, out_reader, capture)
            }
        };
        self.cache_capture = untransformed_capture.or(transformed_capture);

        // Cache write sink channel: the single writer VIO for this key.
        if self.cache_write.is_some() {
            let capture = self.cache_capture.clone().expect("capture reader for cache write");
            let sink = rx.new_buffered_channel(ServiceMap::new());
            let svio = rx.do_io_write(sink, self.cont(), UNBOUNDED, capture);
            {
                let entry = self.vc_table.new_entry();
                entry.chan = Some(sink);
                entry.role = VcRole::CacheWrite;
                entry.write_vio = Some(svio);
                entry.write_handler = Some(SmHandler::CacheSinkWrite);
            }
            self.cache_sink_chan = Some(sink);
            self.cache_sink_vio = Some(svio);
        }

        // Client response header + body write.
        let client_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
        let client_reader = client_buf.alloc_reader();
        let header_bytes = {
            let ctx = self.ctx.borrow();
            ctx.client_resp.as_ref().expect("client response built").to_bytes()
        };
        let header_len = header_bytes.len() as u64;
        client_buf.write(&header_bytes);
        let cvio = rx.do_io_write(self.client_chan, self.cont(), UNBOUNDED, client_reader);
        self.client_write_vio = Some(cvio);
        if let Some(entry) = self.vc_table.find_entry(self.client_chan) {
            entry.write_vio = Some(cvio);
            entry.in_tunnel = true;
        }
        {
            let mut ctx = self.ctx.borrow_mut();
            let status = ctx.client_resp.as_ref().expect("client response built").status.as_u16();
            self.response_sent_status = Some(status);
            ctx.milestones.response_sent = rx.now_ms();
        }
        metrics().count_response(self.response_sent_status.unwrap_or(0));

        self.tunnel = Some(Tunnel::new(
            source,
            chain_input_vio,
            body_out_reader,
            client_buf,
            cvio,
            header_len,
        ));
        self.service_tunnel(rx);
    }

    fn service_tunnel(&mut self, rx: &mut Reactor) {
        let Some(tunnel) = &mut self.tunnel else { return };
        match tunnel.service(rx) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Body framing error mid-stream");
                self.fatal_stream_error(rx);
                return;
            }
        }
        // Keep the sink VIO flowing toward the cache.
        if let Some(svio) = self.cache_sink_vio {
            rx.reenable(svio);
        }
        // Consume a latched EOS once the raw bytes ahead of it are pumped.
        if self.origin_eos_seen
            && self.resp_source == RespSource::Origin
            && self.tunnel.as_ref().map(|t| !t.source.done).unwrap_or(false)
        {
            self.origin_eos_seen = false;
            self.on_body_source_eos(rx);
            return;
        }
        // Ask the origin for more raw bytes while the body is incomplete.
        if !self.tunnel.as_ref().map(|t| t.source.done).unwrap_or(true)
            && let Some(vio) = self.origin_read_vio
        {
            rx.reenable(vio);
        }
    }

    fn on_body_source_eos(&mut self, rx: &mut Reactor) {
        if let Some(tunnel) = &mut self.tunnel {
            tunnel.source.on_eos();
            if tunnel.source.truncated {
                let expected = tunnel.source.expected().unwrap_or(0);
                let received = tunnel.source.produced;
                tracing::warn!(
                    expected = expected,
                    received = received,
                    tag = ProxyError::UpstreamTruncated { expected, received }.tag(),
                    "Origin closed mid-body"
                );
            }
        }
        self.service_tunnel(rx);
    }

    fn fatal_stream_error(&mut self, rx: &mut Reactor) {
        self.abort_cache_write(rx);
        self.finish_txn(rx, TxnDisposition::Close);
    }

    fn on_response_complete(&mut self, rx: &mut Reactor) {
        // Commit or discard the cache write.
        let truncated = self.tunnel.as_ref().map(|t| t.source.truncated).unwrap_or(false);
        if truncated {
            self.abort_cache_write(rx);
        } else {
            self.commit_cache_write(rx);
        }

        // Origin reuse: only a fully consumed keep-alive exchange goes back
        // to the pool.
        let origin_keep = !truncated
            && self
                .ctx
                .borrow()
                .server_resp
                .as_ref()
                .map(|r| r.keep_alive())
                .unwrap_or(false)
            && self.tunnel.as_ref().map(|t| t.source.done).unwrap_or(false);
        self.teardown_origin(rx, origin_keep);

        let keep_alive = {
            let ctx = self.ctx.borrow();
            let req_ka = ctx.client_req.as_ref().map(|r| r.keep_alive()).unwrap_or(false);
            let resp_ka = ctx
                .client_resp
                .as_ref()
                .and_then(|r| r.fields.get("connection"))
                .map(|v| !v.eq_ignore_ascii_case("close"))
                .unwrap_or(true);
            req_ka && resp_ka && !truncated
        };
        let disposition = if keep_alive { TxnDisposition::KeepAlive } else { TxnDisposition::Close };
        self.finish_txn(rx, disposition);
    }

    fn commit_cache_write(&mut self, rx: &mut Reactor) {
        let Some(handle) = self.cache_write.take() else { return };
        let mut body: Vec<u8> = self
            .cache_sink_chan
            .map(|sink| rx.drain(sink).iter().flat_map(|b| b.to_vec()).collect())
            .unwrap_or_default();
        // Whatever the sink pump has not moved yet still sits behind the
        // capture cursor; collect it so the stored body is complete.
        if let Some(capture) = self.cache_capture.take() {
            body.extend_from_slice(&capture.read_all());
        }
        // The transformed form is stored with the headers the client saw.
        let mut handle = handle;
        if self.cache_write_form == Some(CacheWriteForm::Transformed)
            && let Some(mut resp) = self.ctx.borrow().client_resp.clone()
        {
            resp.fields.remove("connection");
            resp.fields.set("content-length", body.len().to_string());
            handle.alt_resp = resp;
        }
        match self.process.cache.borrow_mut().commit_write(handle, Bytes::from(body), rx.now_ms()) {
            Ok(_) => metrics().cache_writes_total.inc(),
            Err(e) => tracing::debug!(error = %e, "Cache commit failed (swallowed)"),
        }
    }

    fn abort_cache_write(&mut self, rx: &mut Reactor) {
        if let Some(handle) = self.cache_write.take() {
            metrics().cache_write_aborts_total.inc();
            self.process.cache.borrow_mut().abort_write(handle);
        }
        if let Some(sink) = self.cache_sink_chan {
            let _ = rx.drain(sink);
        }
    }

    // ── Error emission ────────────────────────────────────────────

    fn send_error(&mut self, rx: &mut Reactor, status: u16) {
        if self.terminated {
            return;
        }
        self.abort_cache_write(rx);
        self.teardown_origin(rx, false);
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = format!("{} {}\r\n", code.as_u16(), http::status_text(code.as_u16()));
        let mut resp = ResponseHeader::new(code);
        resp.fields.set("content-length", body.len().to_string());
        resp.fields.set("content-type", "text/plain");
        resp.fields.set("connection", "close");
        resp.fields.set("cache-control", "no-store");

        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        let mut wire = resp.to_bytes();
        wire.extend_from_slice(body.as_bytes());
        let total = wire.len() as u64;
        buf.write(&wire);
        let vio = rx.do_io_write(self.client_chan, self.cont(), total, reader);
        self.client_write_vio = Some(vio);
        if let Some(entry) = self.vc_table.find_entry(self.client_chan) {
            entry.write_vio = Some(vio);
        }
        self.response_sent_status = Some(status);
        metrics().count_response(status);
        // An error ahead of a half-read upload half-closes rather than
        // resetting, so the client can finish writing what it started.
        let upload_pending = {
            let ctx = self.ctx.borrow();
            ctx.client_req
                .as_ref()
                .map(|req| !matches!(request_body_framing(req), BodyFraming::None))
                .unwrap_or(false)
                && !self.request_body_complete
        };
        self.error_disposition =
            if upload_pending { TxnDisposition::HalfClose } else { TxnDisposition::Close };
        self.ctx.borrow_mut().client_resp = Some(resp);
        self.state = SmState::StreamBody;
        // finish_txn runs on WRITE_COMPLETE for this VIO.
    }

    fn finish_txn(&mut self, rx: &mut Reactor, disposition: TxnDisposition) {
        if self.terminated || self.state == SmState::TxnClose {
            return;
        }
        self.state = SmState::TxnClose;
        self.ctx.borrow_mut().milestones.txn_close = rx.now_ms();
        self.do_api_callout_with_disposition(rx, disposition);
    }

    fn do_api_callout_with_disposition(&mut self, rx: &mut Reactor, disposition: TxnDisposition) {
        self.pending_disposition = disposition;
        self.do_api_callout(rx, HookPoint::TxnClose, AfterCallout::FinishClose);
    }

    fn finish_close(&mut self, rx: &mut Reactor) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let disposition = self.pending_disposition;

        debug_assert!(
            self.ctx.borrow().hook_stats.balanced(),
            "hooks added != hooks fired at TXN_CLOSE"
        );

        // Close transform channels; their continuations see the close and
        // destroy themselves.
        let transforms = self.ctx.borrow().transforms.clone();
        for (chan, _) in transforms {
            if rx.is_chan_open(chan) {
                rx.do_io_close(chan);
            }
        }
        // The client channel belongs to the session, not to this txn.
        self.vc_table.remove_entry(self.client_chan);
        rx.cancel_inactivity_timeout(self.client_chan);
        rx.cancel_active_timeout(self.client_chan);
        self.vc_table.cleanup_all(rx);
        assert!(self.vc_table.is_table_clear(), "vc table not clear at close");
        self.tunnel = None;

        tracing::debug!(txn = self.ctx.borrow().id, "Transaction close");
        if let Some(session) = self.session.upgrade() {
            session.borrow_mut().release_transaction(rx, disposition);
        }
        if let Some(cont) = self.cont.take() {
            rx.unregister_cont(cont);
        }
    }

    // ── Client abort ──────────────────────────────────────────────

    fn on_client_abort(&mut self, rx: &mut Reactor) {
        if self.client_aborted || self.terminated {
            return;
        }
        self.client_aborted = true;
        tracing::debug!(tag = ProxyError::ClientAbort.tag(), "Client went away");
        // The untransformed form is already complete if the origin finished;
        // a transformed write is discarded with the transforms.
        let source_done = self.tunnel.as_ref().map(|t| t.source.done).unwrap_or(false);
        let keep_untransformed = source_done
            && self.cache_write_form == Some(CacheWriteForm::Untransformed)
            && !self.tunnel.as_ref().map(|t| t.source.truncated).unwrap_or(true);
        if keep_untransformed {
            self.commit_cache_write(rx);
        } else {
            self.abort_cache_write(rx);
        }
        self.finish_txn(rx, TxnDisposition::Close);
    }

    // ── Event dispatch ────────────────────────────────────────────

    fn dispatch_vio_event(&mut self, rx: &mut Reactor, event: Event, vio: VioId) {
        let handler = if Some(vio) == self.client_read_vio {
            SmHandler::ClientRead
        } else if Some(vio) == self.client_write_vio {
            SmHandler::ClientWrite
        } else if Some(vio) == self.origin_read_vio {
            match self.resp_source {
                RespSource::Cache => SmHandler::CacheRead,
                RespSource::Origin => SmHandler::OriginRead,
            }
        } else if Some(vio) == self.origin_write_vio {
            SmHandler::OriginWrite
        } else if Some(vio) == self.collector_read_vio {
            SmHandler::CollectorRead
        } else if Some(vio) == self.cache_sink_vio {
            SmHandler::CacheSinkWrite
        } else if self.tunnel.as_ref().and_then(|t| t.chain_input_vio) == Some(vio) {
            SmHandler::ChainInput
        } else {
            return;
        };
        match handler {
            SmHandler::ClientRead => self.on_client_read(rx, event),
            SmHandler::ClientWrite => self.on_client_write(rx, event),
            SmHandler::OriginRead | SmHandler::CacheRead => self.on_origin_read(rx, event),
            SmHandler::OriginWrite => self.on_origin_write(rx, event),
            SmHandler::CollectorRead => self.on_collector_read(rx, event),
            SmHandler::CacheSinkWrite => {}
            SmHandler::ChainInput => self.on_chain_input(rx, event),
        }
    }

    fn on_client_read(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            Event::ReadReady => match self.state {
                SmState::ReqParse => self.try_parse_request(rx),
                SmState::ReadReqBody | SmState::Remap => {
                    if self.req_body.is_some() && self.pump_request_body(rx) {
                        self.do_cache_lookup(rx);
                    }
                }
                _ => {}
            },
            Event::Eos | Event::Error => {
                if self.state == SmState::ReqParse && self.client_reader.read_avail() == 0 {
                    // Clean close between requests; nothing to answer.
                    self.finish_txn(rx, TxnDisposition::Close);
                } else {
                    self.on_client_abort(rx);
                }
            }
            Event::InactivityTimeout | Event::ActiveTimeout => {
                if self.state == SmState::ReqParse || self.state == SmState::ReadReqBody {
                    self.send_error(rx, 408);
                } else {
                    self.on_client_abort(rx);
                }
            }
            _ => {}
        }
    }

    fn on_client_write(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            Event::WriteReady => self.service_tunnel(rx),
            Event::WriteComplete => {
                if self.state == SmState::StreamBody {
                    if self.tunnel.is_some() {
                        self.on_response_complete(rx);
                    } else {
                        // Error responses have no tunnel; the disposition
                        // was chosen when the error was emitted.
                        let disposition = self.error_disposition;
                        self.finish_txn(rx, disposition);
                    }
                }
            }
            Event::Eos | Event::Error => self.on_client_abort(rx),
            _ => {}
        }
    }

    fn on_origin_read(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            Event::ReadReady | Event::ReadComplete => match self.state {
                SmState::ReadResponseHdr => self.try_parse_response(rx),
                SmState::StreamBody => self.service_tunnel(rx),
                _ => {}
            },
            Event::Eos => {
                self.origin_eos_seen = true;
                match self.state {
                    SmState::ReadResponseHdr => {
                        tracing::warn!("Origin closed before response header");
                        self.origin_failed(rx);
                    }
                    SmState::StreamBody => self.on_body_source_eos(rx),
                    // Suspended in a callout; the latch is consumed when
                    // streaming starts.
                    _ => {}
                }
            }
            Event::Error => self.origin_failed(rx),
            Event::InactivityTimeout | Event::ActiveTimeout => {
                tracing::warn!(tag = "upstream_timeout", "Origin timed out");
                if self.state == SmState::ReadResponseHdr {
                    self.teardown_origin(rx, false);
                    self.send_error(rx, 504);
                } else if self.state == SmState::StreamBody {
                    if let Some(tunnel) = &mut self.tunnel {
                        tunnel.source.on_eos();
                    }
                    self.service_tunnel(rx);
                }
            }
            _ => {}
        }
    }

    fn on_origin_write(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            Event::WriteComplete => {
                // Request fully handed to the channel; the response side
                // drives everything from here.
            }
            Event::Error => self.origin_failed(rx),
            _ => {}
        }
    }

    fn on_collector_read(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            Event::ReadReady => self.service_tunnel(rx),
            Event::Eos | Event::ReadComplete => {
                if let Some(tunnel) = &mut self.tunnel {
                    tunnel.collector_done = true;
                }
                self.service_tunnel(rx);
            }
            Event::Error => self.fatal_stream_error(rx),
            _ => {}
        }
    }

    fn on_chain_input(&mut self, rx: &mut Reactor, event: Event) {
        match event {
            // The transform wants more input / acknowledged the end.
            Event::WriteReady | Event::WriteComplete => self.service_tunnel(rx),
            Event::Error => self.fatal_stream_error(rx),
            _ => {}
        }
    }

    pub fn ctx_handle(&self) -> Rc<RefCell<TxnCtx>> {
        Rc::clone(&self.ctx)
    }
}

impl Continuation for HttpSM {
    fn handle_event(&mut self, rx: &mut Reactor, event: Event, data: EventData) {
        if self.terminated {
            return;
        }
        match event {
            Event::Immediate => {
                if let Some(deferred) = data.downcast::<DeferredCallout>() {
                    self.do_api_callout(rx, deferred.0, deferred.1);
                } else if self.state == SmState::TxnInit && self.callout.is_none() {
                    self.do_api_callout(rx, HookPoint::TxnStart, AfterCallout::StartReqParse);
                }
            }
            Event::ApiContinue => {
                self.ctx.borrow_mut().hook_stats.fired += 1;
                self.advance_callout(rx);
            }
            Event::ApiError => {
                self.ctx.borrow_mut().hook_stats.fired += 1;
                self.on_hook_error(rx);
            }
            Event::HostLookup => {
                if let Some(result) = data.downcast::<HostLookupResult>() {
                    self.on_host_lookup(rx, result);
                }
            }
            Event::ConnectDone => {
                if let Some(result) = data.downcast::<ConnectResult>() {
                    self.on_connect_done(rx, result);
                }
            }
            _ => {
                if let Some(vio) = data.vio() {
                    self.dispatch_vio_event(rx, event, vio);
                }
            }
        }
    }
}
