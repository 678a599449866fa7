use std::collections::VecDeque;
use strata_io::ContId;

/// Program points where extensions may run. The state machine suspends at
/// each point until every registered continuation has reenabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    SsnStart,
    SsnClose,
    TxnStart,
    ReadRequestHdr,
    ReadRequestPreRemap,
    OsDns,
    CacheLookupComplete,
    ReadCacheHdr,
    /// Global scope only; handlers may only adjust alternate quality and
    /// must not block on I/O.
    SelectAlt,
    SendRequestHdr,
    ReadResponseHdr,
    ResponseTransform,
    SendResponseHdr,
    TxnClose,
    SslVerifyClient,
    SslVerifyServer,
}

impl HookPoint {
    pub const COUNT: usize = 16;

    pub fn index(self) -> usize {
        match self {
            HookPoint::SsnStart => 0,
            HookPoint::SsnClose => 1,
            HookPoint::TxnStart => 2,
            HookPoint::ReadRequestHdr => 3,
            HookPoint::ReadRequestPreRemap => 4,
            HookPoint::OsDns => 5,
            HookPoint::CacheLookupComplete => 6,
            HookPoint::ReadCacheHdr => 7,
            HookPoint::SelectAlt => 8,
            HookPoint::SendRequestHdr => 9,
            HookPoint::ReadResponseHdr => 10,
            HookPoint::ResponseTransform => 11,
            HookPoint::SendResponseHdr => 12,
            HookPoint::TxnClose => 13,
            HookPoint::SslVerifyClient => 14,
            HookPoint::SslVerifyServer => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::SsnStart => "SSN_START",
            HookPoint::SsnClose => "SSN_CLOSE",
            HookPoint::TxnStart => "TXN_START",
            HookPoint::ReadRequestHdr => "READ_REQUEST_HDR",
            HookPoint::ReadRequestPreRemap => "READ_REQUEST_PRE_REMAP",
            HookPoint::OsDns => "OS_DNS",
            HookPoint::CacheLookupComplete => "CACHE_LOOKUP_COMPLETE",
            HookPoint::ReadCacheHdr => "READ_CACHE_HDR",
            HookPoint::SelectAlt => "SELECT_ALT",
            HookPoint::SendRequestHdr => "SEND_REQUEST_HDR",
            HookPoint::ReadResponseHdr => "READ_RESPONSE_HDR",
            HookPoint::ResponseTransform => "RESPONSE_TRANSFORM",
            HookPoint::SendResponseHdr => "SEND_RESPONSE_HDR",
            HookPoint::TxnClose => "TXN_CLOSE",
            HookPoint::SslVerifyClient => "SSL_VERIFY_CLIENT",
            HookPoint::SslVerifyServer => "SSL_VERIFY_SERVER",
        }
    }

    pub fn is_session_scope(self) -> bool {
        matches!(self, HookPoint::SsnStart | HookPoint::SsnClose)
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook callback reports back via reenable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Short-circuit the transaction to error emission with this status.
    Error(u16),
}

#[derive(Debug, Clone)]
pub struct HookEntry {
    pub cont: ContId,
    /// Registered but not called back (bookkeeping-only registrations).
    pub no_callback: bool,
    /// Name of the registering plugin, tracked so its hooks can be torn
    /// down on reload.
    pub plugin: Option<String>,
}

/// Ordered multiset of continuations per hook point. One list exists at
/// global scope, one per session, and one per transaction.
#[derive(Default)]
pub struct HookList {
    lists: [Vec<HookEntry>; HookPoint::COUNT],
}

impl HookList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, point: HookPoint, cont: ContId) {
        self.lists[point.index()].push(HookEntry { cont, no_callback: false, plugin: None });
    }

    pub fn add_entry(&mut self, point: HookPoint, entry: HookEntry) {
        self.lists[point.index()].push(entry);
    }

    pub fn add_from_plugin(&mut self, point: HookPoint, cont: ContId, plugin: &str) {
        self.lists[point.index()].push(HookEntry {
            cont,
            no_callback: false,
            plugin: Some(plugin.to_string()),
        });
        tracing::debug!(hook = %point, plugin = plugin, "Hook registered from plugin");
    }

    pub fn get(&self, point: HookPoint) -> &[HookEntry] {
        &self.lists[point.index()]
    }

    pub fn count(&self, point: HookPoint) -> usize {
        self.lists[point.index()].iter().filter(|e| !e.no_callback).count()
    }

    pub fn is_empty(&self, point: HookPoint) -> bool {
        self.count(point) == 0
    }

    pub fn total(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }

    /// Drop every hook a plugin registered (called when the plugin is
    /// unloaded on reload).
    pub fn remove_plugin(&mut self, plugin: &str) -> usize {
        let mut removed = 0;
        for list in &mut self.lists {
            let before = list.len();
            list.retain(|e| e.plugin.as_deref() != Some(plugin));
            removed += before - list.len();
        }
        removed
    }
}

/// Walk order for one hook point: the narrow scope first, then the global
/// tail. Built when the state machine reaches the point; continuations
/// added to *later* points after this cursor exists are still seen.
pub struct HookCursor {
    pub point: HookPoint,
    pending: VecDeque<ContId>,
}

impl HookCursor {
    pub fn build(point: HookPoint, narrow: &HookList, global: &HookList) -> Self {
        let mut pending = VecDeque::new();
        for entry in narrow.get(point).iter().chain(global.get(point).iter()) {
            if !entry.no_callback {
                pending.push_back(entry.cont);
            }
        }
        Self { point, pending }
    }

    pub fn next(&mut self) -> Option<ContId> {
        self.pending.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// Per-transaction bookkeeping: every added hook fires exactly once.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookStats {
    pub added: usize,
    pub fired: usize,
}

impl HookStats {
    pub fn balanced(&self) -> bool {
        self.added == self.fired
    }
}
