use crate::background::BackgroundFetcher;
use crate::resolver::Resolver;
use crate::server_session::SessionPool;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use strata_cache::{AltCandidate, CacheStore, CacheVerdict};
use strata_core::ProxyConfig;
use strata_core::http::{RequestHeader, ResponseHeader};
use strata_hooks::{HookAction, HookList, HookPoint, HookStats, UserArgRegistry, UserArgs};
use strata_io::{ChanId, ContId, Event, EventData, Reactor, StekStore};

/// Everything process- or worker-wide a state machine needs, passed in at
/// construction. No hidden globals inside the SM; tests build their own.
pub struct ProcessCtx {
    pub config: Arc<ProxyConfig>,
    /// Global hook tail, walked after the per-txn (or per-ssn) list.
    pub global_hooks: Rc<RefCell<HookList>>,
    pub cache: Rc<RefCell<CacheStore>>,
    pub pool: Rc<RefCell<SessionPool>>,
    pub resolver: Rc<Resolver>,
    pub connector: Rc<RefCell<dyn OriginConnector>>,
    pub user_args: Arc<UserArgRegistry>,
    pub stek: Arc<StekStore>,
    pub background: Rc<RefCell<BackgroundFetcher>>,
    /// Process-wide draining flag (set via the management interface).
    pub drain: Arc<AtomicBool>,
}

/// Async origin connect seam. Production dials a socket from the monoio
/// pump; tests wire a scripted origin.
pub trait OriginConnector {
    fn connect(&mut self, rx: &mut Reactor, addr: SocketAddr, cont: ContId, token: u64);
}

/// Posted back by the connector as `Event::ConnectDone`.
pub struct ConnectResult {
    pub token: u64,
    pub chan: Option<ChanId>,
    pub error: Option<String>,
}

/// Timing milestones recorded per transaction (reactor-clock ms).
#[derive(Debug, Default, Clone, Copy)]
pub struct Milestones {
    pub txn_start: u64,
    pub request_parsed: u64,
    pub cache_lookup_done: u64,
    pub dns_done: u64,
    pub origin_connected: u64,
    pub origin_first_byte: u64,
    pub response_sent: u64,
    pub txn_close: u64,
}

/// One-shot record for a single request/response, shared between the state
/// machine and hook callbacks. Lifetime is bounded by `TXN_START` and
/// `TXN_CLOSE`.
pub struct TxnCtx {
    /// Session transaction counter at txn start; stable for the txn's life.
    pub id: u64,
    pub client_addr: Option<SocketAddr>,

    pub client_req: Option<RequestHeader>,
    /// Request as sent to the origin (post-remap, post-hooks).
    pub server_req: Option<RequestHeader>,
    pub server_resp: Option<ResponseHeader>,
    pub cached_req: Option<RequestHeader>,
    pub cached_resp: Option<ResponseHeader>,
    /// Response being assembled for the client.
    pub client_resp: Option<ResponseHeader>,

    pub cache_verdict: Option<CacheVerdict>,
    /// SELECT_ALT candidates; handlers may only mutate `quality`.
    pub alt_candidates: Vec<AltCandidate>,

    // Cacheability decision bits.
    pub cache_transformed: bool,
    pub cache_untransformed: bool,
    pub no_cache_write: bool,

    pub skip_remap: bool,
    pub half_close_allowed: bool,
    pub cache_url_override: Option<String>,
    pub parent_override: Option<(String, u16)>,
    /// A plugin asked for a Range-stripped background fetch of this txn's
    /// object.
    pub background_fetch_requested: bool,

    pub server_addr: Option<SocketAddr>,
    pub next_hop_addr: Option<SocketAddr>,

    /// Response transforms in registration order.
    pub transforms: Vec<(ChanId, ContId)>,
    /// Chain wiring (transform channel → its output channel), filled in
    /// when the tunnel assembles the chain.
    pub transform_outputs: Vec<(ChanId, ChanId)>,

    pub txn_hooks: HookList,
    pub hook_stats: HookStats,
    pub user_args: UserArgs,
    pub milestones: Milestones,

    /// Error status chosen by a failing hook (default 500).
    pub hook_error_status: u16,
}

impl TxnCtx {
    pub fn new(id: u64, client_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            client_addr,
            client_req: None,
            server_req: None,
            server_resp: None,
            cached_req: None,
            cached_resp: None,
            client_resp: None,
            cache_verdict: None,
            alt_candidates: Vec::new(),
            cache_transformed: false,
            cache_untransformed: true,
            no_cache_write: false,
            skip_remap: false,
            half_close_allowed: false,
            cache_url_override: None,
            parent_override: None,
            background_fetch_requested: false,
            server_addr: None,
            next_hop_addr: None,
            transforms: Vec::new(),
            transform_outputs: Vec::new(),
            txn_hooks: HookList::new(),
            hook_stats: HookStats::default(),
            user_args: UserArgs::new(),
            milestones: Milestones::default(),
            hook_error_status: 500,
        }
    }

    /// Add a hook to a later point of this transaction.
    pub fn add_hook(&mut self, point: HookPoint, cont: ContId) {
        self.txn_hooks.add(point, cont);
    }

    /// Register a response transform channel (created with
    /// `transform_create`); chained in registration order.
    pub fn add_response_transform(&mut self, chan: ChanId, cont: ContId) {
        self.transforms.push((chan, cont));
    }

    /// Where a transform writes its output: the next transform in the
    /// chain, or the tunnel's collector.
    pub fn transform_output(&self, chan: ChanId) -> Option<ChanId> {
        self.transform_outputs
            .iter()
            .find(|(c, _)| *c == chan)
            .map(|(_, out)| *out)
    }

    pub fn set_parent_proxy(&mut self, host: &str, port: u16) {
        self.parent_override = Some((host.to_string(), port));
    }

    pub fn set_cache_url(&mut self, url: &str) {
        self.cache_url_override = Some(url.to_string());
    }
}

/// Session-scope payload handed to SSN_START / SSN_CLOSE handlers.
#[derive(Clone)]
pub struct SsnHandle {
    pub id: u64,
    pub chan: ChanId,
    pub hooks: Rc<RefCell<HookList>>,
    pub transaction_count: u64,
}

/// Payload delivered to a hook continuation. The callback must call
/// [`HookInvocation::reenable`] exactly once (SELECT_ALT excepted: it is
/// synchronous and must not block).
pub struct HookInvocation {
    pub point: HookPoint,
    /// Absent for synchronous points (SELECT_ALT) which take no reenable.
    reply_to: Option<ContId>,
    pub txn: Option<Rc<RefCell<TxnCtx>>>,
    pub ssn: Option<SsnHandle>,
}

impl HookInvocation {
    pub fn for_txn(point: HookPoint, reply_to: ContId, txn: Rc<RefCell<TxnCtx>>) -> Self {
        Self { point, reply_to: Some(reply_to), txn: Some(txn), ssn: None }
    }

    pub fn for_ssn(point: HookPoint, reply_to: ContId, ssn: SsnHandle) -> Self {
        Self { point, reply_to: Some(reply_to), txn: None, ssn: Some(ssn) }
    }

    pub fn synchronous(point: HookPoint, txn: Rc<RefCell<TxnCtx>>) -> Self {
        Self { point, reply_to: None, txn: Some(txn), ssn: None }
    }

    pub fn needs_reenable(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Resume the suspended state machine (or session). `Continue` proceeds;
    /// `Error` short-circuits to error-response emission.
    pub fn reenable(&self, rx: &mut Reactor, action: HookAction) {
        let Some(reply_to) = self.reply_to else { return };
        match action {
            HookAction::Continue => {
                rx.schedule(reply_to, Event::ApiContinue, EventData::None);
            }
            HookAction::Error(status) => {
                if let Some(txn) = &self.txn {
                    txn.borrow_mut().hook_error_status = status;
                }
                rx.schedule(reply_to, Event::ApiError, EventData::None);
            }
        }
    }
}
