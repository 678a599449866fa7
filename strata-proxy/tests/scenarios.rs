//! End-to-end transaction scenarios driven over in-memory channels: a
//! scripted origin stands in for the network, the reactor clock is advanced
//! by hand, and every byte the client sees is asserted against.

use bytes::Bytes;
use dashmap::DashMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use strata_cache::{CacheStore, CacheVerdict};
use strata_core::ProxyConfig;
use strata_core::http::{RequestHeader, ResponseHeader};
use strata_hooks::{HookAction, HookList, HookPoint};
use strata_io::{
    Alpn, ChanId, ContId, Continuation, Event, EventData, Reactor, ServiceMap, StekStore,
    TlsBasic,
};
use strata_proxy::background::BackgroundFetcher;
use strata_proxy::resolver::Resolver;
use strata_proxy::server_session::SessionPool;
use strata_proxy::session::{ClientSession, SessionState};
use strata_proxy::transform::ByteTransform;
use strata_proxy::txn::{ConnectResult, HookInvocation, OriginConnector, ProcessCtx, TxnCtx};

// ── Scripted origin ───────────────────────────────────────────

type ServeFn = Rc<dyn Fn(&RequestHeader) -> Vec<u8>>;

#[derive(Clone)]
enum Behavior {
    /// TCP-level connection refused.
    Refuse,
    /// Keep-alive origin answering every complete request.
    Serve(ServeFn),
    /// Answers the first request, then closes the connection.
    ServeThenClose(ServeFn),
    /// Accepts the connection and never says anything.
    Silent,
}

struct OriginConn {
    chan: ChanId,
    addr: SocketAddr,
    buf: Vec<u8>,
    closed: bool,
}

struct ScriptedConnector {
    behaviors: HashMap<SocketAddr, Behavior>,
    origins: Vec<OriginConn>,
    connect_attempts: Vec<SocketAddr>,
    received: Vec<RequestHeader>,
}

impl ScriptedConnector {
    fn new(behaviors: HashMap<SocketAddr, Behavior>) -> Self {
        Self { behaviors, origins: Vec::new(), connect_attempts: Vec::new(), received: Vec::new() }
    }
}

impl OriginConnector for ScriptedConnector {
    fn connect(&mut self, rx: &mut Reactor, addr: SocketAddr, cont: ContId, token: u64) {
        self.connect_attempts.push(addr);
        match self.behaviors.get(&addr) {
            None | Some(Behavior::Refuse) => {
                rx.post_completion(
                    cont,
                    Event::ConnectDone,
                    ConnectResult { token, chan: None, error: Some("connection refused".into()) },
                );
            }
            Some(_) => {
                let chan = rx.new_buffered_channel(ServiceMap::new());
                self.origins.push(OriginConn { chan, addr, buf: Vec::new(), closed: false });
                rx.post_completion(
                    cont,
                    Event::ConnectDone,
                    ConnectResult { token, chan: Some(chan), error: None },
                );
            }
        }
    }
}

// ── Hook plugin helper ────────────────────────────────────────

struct HookFn<F: FnMut(&mut Reactor, &HookInvocation) -> HookAction> {
    f: F,
}

impl<F: FnMut(&mut Reactor, &HookInvocation) -> HookAction> Continuation for HookFn<F> {
    fn handle_event(&mut self, rx: &mut Reactor, _event: Event, data: EventData) {
        if let Some(invocation) = data.downcast::<HookInvocation>() {
            let action = (self.f)(rx, &invocation);
            invocation.reenable(rx, action);
        }
    }
}

// ── Harness ───────────────────────────────────────────────────

struct Harness {
    rx: Reactor,
    process: Rc<ProcessCtx>,
    connector: Rc<RefCell<ScriptedConnector>>,
    client_chan: Option<ChanId>,
    session: Option<Rc<RefCell<ClientSession>>>,
    client_out: Vec<u8>,
    next_ssn: u64,
}

fn origin_addr() -> SocketAddr {
    "10.0.0.1:80".parse().unwrap()
}

impl Harness {
    fn build(
        configure: impl FnOnce(&mut ProxyConfig),
        behaviors: HashMap<SocketAddr, Behavior>,
        overrides: HashMap<String, Vec<SocketAddr>>,
    ) -> Self {
        let mut config = ProxyConfig::default();
        configure(&mut config);
        let config = Arc::new(config);

        let mut rx = Reactor::new();
        let pool = Rc::new(RefCell::new(SessionPool::new(
            config.proxy.keepalive_pool_size,
            config.proxy.keep_alive_no_activity_ms,
        )));
        let pool_cont = rx.register_cont(pool.clone());
        pool.borrow_mut().set_cont(pool_cont);

        let connector = Rc::new(RefCell::new(ScriptedConnector::new(behaviors)));
        let process = Rc::new(ProcessCtx {
            config: Arc::clone(&config),
            global_hooks: Rc::new(RefCell::new(HookList::new())),
            cache: Rc::new(RefCell::new(CacheStore::new(config.cache.clone()))),
            pool,
            resolver: Rc::new(Resolver::with_overrides(overrides)),
            connector: connector.clone(),
            user_args: Arc::new(strata_hooks::UserArgRegistry::new()),
            stek: Arc::new(StekStore::new_random()),
            background: Rc::new(RefCell::new(BackgroundFetcher::new(Arc::new(DashMap::new())))),
            drain: Arc::new(AtomicBool::new(false)),
        });
        Self {
            rx,
            process,
            connector,
            client_chan: None,
            session: None,
            client_out: Vec::new(),
            next_ssn: 0,
        }
    }

    /// Default single-origin harness: `origin.test` → one scripted server.
    fn with_origin(behavior: Behavior) -> Self {
        let mut behaviors = HashMap::new();
        behaviors.insert(origin_addr(), behavior);
        let mut overrides = HashMap::new();
        overrides.insert("origin.test".to_string(), vec![origin_addr()]);
        Self::build(|_| {}, behaviors, overrides)
    }

    fn add_global_hook(
        &mut self,
        point: HookPoint,
        f: impl FnMut(&mut Reactor, &HookInvocation) -> HookAction + 'static,
    ) {
        let cont = self.rx.register_cont(Rc::new(RefCell::new(HookFn { f })));
        self.process.global_hooks.borrow_mut().add(point, cont);
    }

    fn new_session(&mut self) {
        self.new_session_with_services(ServiceMap::new());
    }

    fn new_session_with_services(&mut self, mut services: ServiceMap) {
        services.register(Alpn::http1());
        self.next_ssn += 1;
        let chan = self.rx.new_buffered_channel(services);
        let session = ClientSession::new_connection(
            &mut self.rx,
            Rc::clone(&self.process),
            chan,
            Some("192.0.2.9:55000".parse().unwrap()),
            self.next_ssn,
        );
        self.client_chan = Some(chan);
        self.session = Some(session);
        self.client_out.clear();
        self.settle();
    }

    fn feed_client(&mut self, bytes: &[u8]) {
        let chan = self.client_chan.expect("session open");
        self.rx.feed(chan, Bytes::copy_from_slice(bytes));
        self.settle();
    }

    fn client_eos(&mut self) {
        let chan = self.client_chan.expect("session open");
        self.rx.feed_eos(chan);
        self.settle();
    }

    /// Run the reactor and the scripted origins until nothing moves.
    fn settle(&mut self) {
        loop {
            self.rx.run();
            let mut progressed = false;

            // Collect client-bound bytes.
            if let Some(chan) = self.client_chan {
                for seg in self.rx.drain(chan) {
                    self.client_out.extend_from_slice(&seg);
                    progressed = true;
                }
            }

            // Pump each scripted origin.
            let count = self.connector.borrow().origins.len();
            for i in 0..count {
                let (chan, addr, closed) = {
                    let c = self.connector.borrow();
                    (c.origins[i].chan, c.origins[i].addr, c.origins[i].closed)
                };
                if closed {
                    continue;
                }
                let drained = self.rx.drain(chan);
                if !drained.is_empty() {
                    progressed = true;
                    let mut c = self.connector.borrow_mut();
                    for seg in drained {
                        c.origins[i].buf.extend_from_slice(&seg);
                    }
                }
                // A complete request present? Answer it.
                let reply = {
                    let mut c = self.connector.borrow_mut();
                    let behavior = c.behaviors.get(&addr).cloned();
                    let parsed = RequestHeader::parse(&c.origins[i].buf).ok().flatten();
                    match (behavior, parsed) {
                        (Some(Behavior::Silent), _) | (None, _) | (Some(Behavior::Refuse), _) => None,
                        (Some(behavior), Some((req, hlen))) => {
                            let body_len: usize = req
                                .fields
                                .get("content-length")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0);
                            if c.origins[i].buf.len() >= hlen + body_len {
                                c.origins[i].buf.drain(..hlen + body_len);
                                c.received.push(req.clone());
                                match behavior {
                                    Behavior::Serve(f) => Some((f(&req), false)),
                                    Behavior::ServeThenClose(f) => Some((f(&req), true)),
                                    _ => None,
                                }
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                };
                if let Some((bytes, close)) = reply {
                    self.rx.feed(chan, Bytes::from(bytes));
                    if close {
                        self.rx.feed_eos(chan);
                        self.connector.borrow_mut().origins[i].closed = true;
                    }
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Parse everything the client has received so far as one response.
    fn last_response(&self) -> (ResponseHeader, Vec<u8>) {
        let (resp, hlen) = ResponseHeader::parse(&self.client_out)
            .expect("well-formed response")
            .expect("complete response header");
        let body = self.client_out[hlen..].to_vec();
        (resp, body)
    }

    fn session_state(&self) -> SessionState {
        self.session.as_ref().expect("session open").borrow().state()
    }

    fn connect_attempts(&self) -> Vec<SocketAddr> {
        self.connector.borrow().connect_attempts.clone()
    }

    fn origin_requests(&self) -> Vec<RequestHeader> {
        self.connector.borrow().received.clone()
    }
}

fn ok_origin(body: &'static str, extra_headers: &'static str) -> Behavior {
    Behavior::Serve(Rc::new(move |_req| {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n{}",
            body.len(),
            extra_headers,
            body
        )
        .into_bytes()
    }))
}

const GET_A: &[u8] = b"GET /a HTTP/1.1\r\nHost: origin.test\r\n\r\n";

// ── S1: cache miss then hit ───────────────────────────────────

#[test]
fn s1_cache_miss_then_hit() {
    let mut h = Harness::with_origin(ok_origin("hello-origin", "Cache-Control: max-age=60\r\n"));
    let verdicts: Rc<RefCell<Vec<CacheVerdict>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let verdicts = Rc::clone(&verdicts);
        h.add_global_hook(HookPoint::CacheLookupComplete, move |_rx, inv| {
            let ctx = inv.txn.as_ref().unwrap().borrow();
            verdicts.borrow_mut().push(ctx.cache_verdict.unwrap());
            HookAction::Continue
        });
    }

    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"hello-origin");
    assert_eq!(h.connect_attempts().len(), 1);

    // Second identical request: served from cache, no origin traffic.
    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"hello-origin");
    assert_eq!(h.connect_attempts().len(), 1, "cache hit must not touch the origin");
    assert_eq!(h.origin_requests().len(), 1);

    assert_eq!(*verdicts.borrow(), vec![CacheVerdict::Miss, CacheVerdict::HitFresh]);
}

// ── S2: revalidation via If-None-Match / 304 ──────────────────

#[test]
fn s2_stale_hit_revalidates_with_304() {
    let behavior = Behavior::Serve(Rc::new(|req: &RequestHeader| {
        if req.fields.get("if-none-match") == Some("\"v1\"") {
            b"HTTP/1.1 304 Not Modified\r\nCache-Control: max-age=0\r\n\r\n".to_vec()
        } else {
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nETag: \"v1\"\r\nCache-Control: max-age=0\r\n\r\nbody"
                .to_vec()
        }
    }));
    let mut h = Harness::with_origin(behavior);

    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"body");

    // max-age=0: the stored entry is immediately stale.
    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200, "client sees the cached 200, not the 304");
    assert_eq!(body, b"body");

    let reqs = h.origin_requests();
    assert_eq!(reqs.len(), 2);
    assert_eq!(
        reqs[1].fields.get("if-none-match"),
        Some("\"v1\""),
        "revalidation must be conditional"
    );
}

// ── S3: transform + cache-untransformed policy ────────────────

#[test]
fn s3_transform_with_untransformed_cache() {
    let mut h = Harness::with_origin(ok_origin("response payload", "Cache-Control: max-age=60\r\n"));
    // Install an uppercase transform for both the origin path and the
    // cache-serve path, caching only the untransformed form.
    let install = |rx: &mut Reactor, ctx: &Rc<RefCell<TxnCtx>>| {
        ByteTransform::install(rx, ctx, |chunk| chunk.to_ascii_uppercase());
        let mut ctx = ctx.borrow_mut();
        ctx.cache_transformed = false;
        ctx.cache_untransformed = true;
    };
    h.add_global_hook(HookPoint::ReadResponseHdr, move |rx, inv| {
        install(rx, inv.txn.as_ref().unwrap());
        HookAction::Continue
    });
    h.add_global_hook(HookPoint::ReadCacheHdr, move |rx, inv| {
        install(rx, inv.txn.as_ref().unwrap());
        HookAction::Continue
    });

    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"RESPONSE PAYLOAD");

    // The stored alternate is the identity form.
    {
        let cache = h.process.cache.borrow();
        let req = {
            let (req, _) = RequestHeader::parse(GET_A).unwrap().unwrap();
            req
        };
        let lookup = cache.lookup(&req, None, h.rx.now_ms());
        assert_eq!(lookup.verdict, CacheVerdict::HitFresh);
        let alt = cache.get_alternate(&lookup.key, lookup.candidates[0].alt_id).unwrap();
        assert_eq!(&alt.body[..], b"response payload", "cache stores the untransformed body");
    }

    // Request 2: hit, transform re-applied; body equals request 1's body.
    h.new_session();
    h.feed_client(GET_A);
    let (_, body2) = h.last_response();
    assert_eq!(body2, b"RESPONSE PAYLOAD");
    assert_eq!(h.origin_requests().len(), 1, "second request served from cache");
}

// ── S4: parent-proxy failover ─────────────────────────────────

fn parent_harness(p1: Behavior, p2: Behavior) -> Harness {
    let a1: SocketAddr = "10.1.0.1:3128".parse().unwrap();
    let a2: SocketAddr = "10.1.0.2:3128".parse().unwrap();
    let mut behaviors = HashMap::new();
    behaviors.insert(a1, p1);
    behaviors.insert(a2, p2);
    let mut overrides = HashMap::new();
    overrides.insert("p1".to_string(), vec![a1]);
    overrides.insert("p2".to_string(), vec![a2]);
    Harness::build(
        |config| {
            config.parents = vec!["p1:3128".into(), "p2:3128".into()];
        },
        behaviors,
        overrides,
    )
}

#[test]
fn s4_parent_failover_on_refused_connection() {
    let echo = Behavior::Serve(Rc::new(|req: &RequestHeader| {
        let id = req.fields.get("x-request-id").unwrap_or("?").to_string();
        format!("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Response-ID: {id}\r\n\r\nok").into_bytes()
    }));
    let mut h = parent_harness(Behavior::Refuse, echo);

    h.new_session();
    h.feed_client(b"GET http://foo/ HTTP/1.1\r\nX-Request-ID: 11\r\n\r\n");
    let (resp, _body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.fields.get("x-response-id"), Some("11"));
    assert_eq!(h.connect_attempts().len(), 2, "first parent refused, second used");

    // Parents receive the absolute-form target.
    assert_eq!(h.origin_requests()[0].target, "http://foo/");
}

#[test]
fn s4_both_parents_refused_yields_502() {
    let mut h = parent_harness(Behavior::Refuse, Behavior::Refuse);
    h.new_session();
    h.feed_client(b"GET http://foo/ HTTP/1.1\r\nX-Request-ID: 11\r\n\r\n");
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 502);
}

#[test]
fn parent_5xx_fails_over_to_next_parent() {
    let bad = Behavior::Serve(Rc::new(|_req: &RequestHeader| {
        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n".to_vec()
    }));
    let good = Behavior::Serve(Rc::new(|_req: &RequestHeader| {
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
    }));
    let mut h = parent_harness(bad, good);
    h.new_session();
    h.feed_client(b"GET http://foo/ HTTP/1.1\r\n\r\n");
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"ok");
    assert_eq!(h.origin_requests().len(), 2);
}

// ── S5: hook event ordering on a MISS ─────────────────────────

#[test]
fn s5_hook_order_for_cache_miss() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    let fired: Rc<RefCell<Vec<HookPoint>>> = Rc::new(RefCell::new(Vec::new()));
    for point in [
        HookPoint::TxnStart,
        HookPoint::ReadRequestHdr,
        HookPoint::OsDns,
        HookPoint::CacheLookupComplete,
        HookPoint::SendRequestHdr,
        HookPoint::ReadResponseHdr,
        HookPoint::SendResponseHdr,
        HookPoint::TxnClose,
    ] {
        let fired = Rc::clone(&fired);
        h.add_global_hook(point, move |_rx, inv| {
            fired.borrow_mut().push(inv.point);
            HookAction::Continue
        });
    }

    h.new_session();
    h.feed_client(GET_A);
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);

    // DNS completes after the cache verdict here; the spec allows either
    // relative order of OS_DNS and CACHE_LOOKUP_COMPLETE.
    assert_eq!(
        *fired.borrow(),
        vec![
            HookPoint::TxnStart,
            HookPoint::ReadRequestHdr,
            HookPoint::CacheLookupComplete,
            HookPoint::OsDns,
            HookPoint::SendRequestHdr,
            HookPoint::ReadResponseHdr,
            HookPoint::SendResponseHdr,
            HookPoint::TxnClose,
        ]
    );
}

// ── Hook bookkeeping & transaction-id stability ───────────────

#[test]
fn every_added_hook_fires_exactly_once() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    let captured: Rc<RefCell<Option<Rc<RefCell<TxnCtx>>>>> = Rc::new(RefCell::new(None));
    {
        let captured = Rc::clone(&captured);
        h.add_global_hook(HookPoint::TxnStart, move |_rx, inv| {
            *captured.borrow_mut() = Some(Rc::clone(inv.txn.as_ref().unwrap()));
            HookAction::Continue
        });
    }
    h.add_global_hook(HookPoint::ReadRequestHdr, |_rx, _inv| HookAction::Continue);
    h.add_global_hook(HookPoint::TxnClose, |_rx, _inv| HookAction::Continue);

    h.new_session();
    h.feed_client(GET_A);
    let ctx = captured.borrow().clone().expect("txn observed");
    let stats = ctx.borrow().hook_stats;
    assert!(stats.added >= 3);
    assert_eq!(stats.added, stats.fired, "hooks added must equal hooks fired at TXN_CLOSE");
}

#[test]
fn transaction_id_is_stable_and_counts_per_session() {
    let mut h = Harness::with_origin(ok_origin("x", "Cache-Control: max-age=60\r\n"));
    let ids: Rc<RefCell<Vec<(HookPoint, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    for point in [HookPoint::TxnStart, HookPoint::TxnClose] {
        let ids = Rc::clone(&ids);
        h.add_global_hook(point, move |_rx, inv| {
            ids.borrow_mut().push((inv.point, inv.txn.as_ref().unwrap().borrow().id));
            HookAction::Continue
        });
    }

    h.new_session();
    h.feed_client(GET_A);
    h.feed_client(GET_A); // keep-alive: second txn on the same session
    let ids = ids.borrow();
    assert_eq!(
        *ids,
        vec![
            (HookPoint::TxnStart, 1),
            (HookPoint::TxnClose, 1),
            (HookPoint::TxnStart, 2),
            (HookPoint::TxnClose, 2),
        ]
    );
    let session = h.session.as_ref().unwrap().borrow();
    assert_eq!(session.transaction_count(), 2);
    assert_eq!(session.released_count(), 2);
    assert_eq!(session.state(), SessionState::KeepAlive);
}

// ── Hook error short-circuit ──────────────────────────────────

#[test]
fn hook_error_emits_configured_status_and_closes() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.add_global_hook(HookPoint::ReadRequestHdr, |_rx, _inv| HookAction::Error(403));

    h.new_session();
    h.feed_client(GET_A);
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 403);
    assert!(h.connect_attempts().is_empty(), "no origin contact after hook error");
    assert_eq!(h.session_state(), SessionState::Closed);
}

// ── Half-close policy ─────────────────────────────────────────

#[test]
fn early_error_with_upload_in_flight_half_closes_plain_tcp() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.add_global_hook(HookPoint::ReadRequestHdr, |_rx, _inv| HookAction::Error(413));

    h.new_session();
    // Upload announced but not finished when the error fires.
    h.feed_client(b"POST /up HTTP/1.1\r\nHost: origin.test\r\nContent-Length: 50\r\n\r\npartial");
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 413);
    assert_eq!(
        h.session_state(),
        SessionState::HalfClosed,
        "read side must drain while the client finishes its upload"
    );

    // The rest of the upload is swallowed, then idle timeout closes it.
    h.feed_client(&[b'x'; 43]);
    assert_eq!(h.session_state(), SessionState::HalfClosed);
    h.rx.advance(120_000);
    h.settle();
    assert_eq!(h.session_state(), SessionState::Closed);
}

#[test]
fn half_close_is_rejected_on_tls_channels() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.add_global_hook(HookPoint::ReadRequestHdr, |_rx, _inv| HookAction::Error(413));

    let mut services = ServiceMap::new();
    services.register(TlsBasic {
        protocol: "TLSv1.3".into(),
        cipher: "TLS_AES_128_GCM_SHA256".into(),
        sni: Some("origin.test".into()),
        session_reused: false,
    });
    h.new_session_with_services(services);
    h.feed_client(b"POST /up HTTP/1.1\r\nHost: origin.test\r\nContent-Length: 50\r\n\r\npartial");
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 413);
    assert_eq!(h.session_state(), SessionState::Closed, "TLS forbids half-close");
}

// ── Truncated origin body ─────────────────────────────────────

#[test]
fn truncated_origin_discards_partial_cache_write() {
    let behavior = Behavior::ServeThenClose(Rc::new(|_req: &RequestHeader| {
        // Promises 100 bytes, delivers 5, then closes.
        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nCache-Control: max-age=60\r\n\r\nshort".to_vec()
    }));
    let mut h = Harness::with_origin(behavior);

    h.new_session();
    h.feed_client(GET_A);
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(body, b"short", "truncated body propagates as-is");
    assert_eq!(h.session_state(), SessionState::Closed);
    assert!(h.process.cache.borrow().is_empty(), "partial alternate must be discarded");
}

// ── Origin timeout ────────────────────────────────────────────

#[test]
fn silent_origin_times_out_with_504() {
    let mut h = Harness::with_origin(Behavior::Silent);
    h.new_session();
    h.feed_client(GET_A);
    assert!(h.client_out.is_empty(), "nothing to say while the origin is silent");
    h.rx.advance(30_000);
    h.settle();
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 504);
}

// ── Client parse errors and timeouts ──────────────────────────

#[test]
fn malformed_request_yields_400() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.new_session();
    h.feed_client(b"\x01\x02 garbage\r\n\r\n");
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 400);
    assert_eq!(h.session_state(), SessionState::Closed);
}

#[test]
fn idle_mid_request_times_out_with_408() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.new_session();
    h.feed_client(b"GET /a HTTP/1.1\r\nHo");
    h.rx.advance(30_000);
    h.settle();
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 408);
}

// ── Pipelined requests are flattened ──────────────────────────

#[test]
fn pipelined_requests_are_serialized() {
    let mut h = Harness::with_origin(ok_origin("pipelined", "Cache-Control: max-age=60\r\n"));
    h.new_session();
    let mut two = Vec::new();
    two.extend_from_slice(GET_A);
    two.extend_from_slice(GET_A);
    h.feed_client(&two);
    // Both responses arrive, in order, on one connection.
    let first = ResponseHeader::parse(&h.client_out).unwrap().unwrap();
    let rest = &h.client_out[first.1 + 9..]; // skip "pipelined"
    let second = ResponseHeader::parse(rest).unwrap().unwrap();
    assert_eq!(first.0.status.as_u16(), 200);
    assert_eq!(second.0.status.as_u16(), 200);
    let session = h.session.as_ref().unwrap().borrow();
    assert_eq!(session.transaction_count(), 2);
    assert_eq!(session.released_count(), 2);
}

// ── Client abort mid-stream ───────────────────────────────────

#[test]
fn client_abort_closes_transaction_cleanly() {
    let mut h = Harness::with_origin(Behavior::Silent);
    h.new_session();
    h.feed_client(GET_A);
    // Client gives up while we wait on the origin.
    h.client_eos();
    assert_eq!(h.session_state(), SessionState::Closed);
    let session = h.session.as_ref().unwrap().borrow();
    assert_eq!(session.transaction_count(), session.released_count());
}

// ── Origin connection reuse through the pool ──────────────────

#[test]
fn origin_connection_is_pooled_and_reused() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.new_session();
    h.feed_client(GET_A);
    assert_eq!(h.process.pool.borrow().idle_count(), 1, "keep-alive origin parked");

    // Uncacheable response (no cache headers + default ttl 0): the second
    // request goes to the origin again, reusing the pooled connection.
    h.new_session();
    h.feed_client(GET_A);
    assert_eq!(h.origin_requests().len(), 2);
    assert_eq!(h.connect_attempts().len(), 1, "second request reuses the pooled session");
}

// ── Client conditional against a fresh hit ────────────────────

#[test]
fn client_if_none_match_on_fresh_hit_yields_304() {
    let mut h = Harness::with_origin(ok_origin(
        "versioned",
        "Cache-Control: max-age=60\r\nETag: \"v1\"\r\n",
    ));
    h.new_session();
    h.feed_client(GET_A);
    let (resp, _) = h.last_response();
    assert_eq!(resp.status.as_u16(), 200);

    h.new_session();
    h.feed_client(b"GET /a HTTP/1.1\r\nHost: origin.test\r\nIf-None-Match: \"v1\"\r\n\r\n");
    let (resp, body) = h.last_response();
    assert_eq!(resp.status.as_u16(), 304);
    assert_eq!(resp.etag(), Some("\"v1\""));
    assert!(body.is_empty(), "304 carries no body");
    assert_eq!(h.origin_requests().len(), 1, "validated from cache alone");
}

// ── Background fetch on plugin request ────────────────────────

#[test]
fn plugin_requested_background_fetch_is_scheduled_once() {
    let mut h = Harness::with_origin(ok_origin("x", ""));
    h.add_global_hook(HookPoint::ReadResponseHdr, |_rx, inv| {
        inv.txn.as_ref().unwrap().borrow_mut().background_fetch_requested = true;
        HookAction::Continue
    });
    h.new_session();
    h.feed_client(b"GET /big HTTP/1.1\r\nHost: origin.test\r\nRange: bytes=0-9\r\n\r\n");
    let pending = h.process.background.borrow_mut().take_pending();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].req.fields.contains("range"), "background fetch strips Range");
}
