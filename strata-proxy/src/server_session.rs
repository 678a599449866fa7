use crate::metrics::metrics;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use strata_io::buffer::BUFFER_SIZE_INDEX_4K;
use strata_io::{ChanId, ContId, Continuation, Event, EventData, IoBuffer, Reactor, UNBOUNDED};

/// Pool key: origin sessions are only reusable for the same address, SNI,
/// and protocol stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub addr: SocketAddr,
    pub sni: Option<String>,
    pub proto: &'static str,
}

impl PoolKey {
    pub fn http1(addr: SocketAddr) -> Self {
        Self { addr, sni: None, proto: "http/1.1" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSessionState {
    /// Held exclusively by one client session for an in-flight transaction.
    KaReserved,
    /// Parked in the pool with a keep-alive read armed.
    Pooled,
}

/// A poolable connection to an origin.
pub struct ServerSession {
    pub chan: ChanId,
    pub key: PoolKey,
    pub state: ServerSessionState,
    pub transactions: u64,
}

impl ServerSession {
    pub fn new(chan: ChanId, key: PoolKey) -> Self {
        Self { chan, key, state: ServerSessionState::KaReserved, transactions: 0 }
    }
}

/// Thread-local pool of idle origin sessions. No cross-thread handoff:
/// each worker owns its own pool. While parked, a keep-alive read watches
/// for the far side closing; any byte or EOS on a parked session kills it.
pub struct SessionPool {
    pools: HashMap<PoolKey, VecDeque<ServerSession>>,
    max_idle: usize,
    keep_alive_ms: u64,
    cont: Option<ContId>,
}

impl SessionPool {
    pub fn new(max_idle_per_key: usize, keep_alive_ms: u64) -> Self {
        Self { pools: HashMap::new(), max_idle: max_idle_per_key, keep_alive_ms, cont: None }
    }

    /// The pool is itself a continuation (it owns the parked read VIOs);
    /// the worker registers it and hands the id back here.
    pub fn set_cont(&mut self, cont: ContId) {
        self.cont = Some(cont);
    }

    pub fn idle_count(&self) -> usize {
        self.pools.values().map(|q| q.len()).sum()
    }

    /// Take a healthy parked session for `key`, if any.
    pub fn acquire(&mut self, rx: &mut Reactor, key: &PoolKey) -> Option<ServerSession> {
        let queue = self.pools.get_mut(key)?;
        while let Some(mut session) = queue.pop_front() {
            if rx.chan_closed(session.chan) {
                continue;
            }
            rx.cancel_inactivity_timeout(session.chan);
            session.state = ServerSessionState::KaReserved;
            metrics().pooled_origin_sessions.dec();
            tracing::debug!(addr = %key.addr, "Origin session reused from pool");
            return Some(session);
        }
        None
    }

    /// Park a session: arm the keep-alive watchdog read and queue it.
    /// Returns false (and closes the channel) when the pool is full or the
    /// pool has no continuation to own the watchdog.
    pub fn release(&mut self, rx: &mut Reactor, mut session: ServerSession) -> bool {
        let Some(cont) = self.cont else {
            rx.do_io_close(session.chan);
            return false;
        };
        if rx.chan_closed(session.chan) {
            return false;
        }
        let queue = self.pools.entry(session.key.clone()).or_default();
        if queue.len() >= self.max_idle {
            rx.do_io_close(session.chan);
            return false;
        }
        session.state = ServerSessionState::Pooled;
        let watch_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(session.chan, cont, UNBOUNDED, watch_buf);
        rx.set_inactivity_timeout(session.chan, self.keep_alive_ms);
        metrics().pooled_origin_sessions.inc();
        queue.push_back(session);
        true
    }

    fn evict_chan(&mut self, rx: &mut Reactor, chan: ChanId) {
        let mut found = false;
        for queue in self.pools.values_mut() {
            let before = queue.len();
            queue.retain(|s| s.chan != chan);
            if queue.len() != before {
                metrics().pooled_origin_sessions.dec();
                found = true;
            }
        }
        // A stale watchdog event can race an acquire; only a session still
        // parked here is ours to close.
        if found {
            rx.do_io_close(chan);
        }
    }

    /// Close every idle session (used at drain/shutdown).
    pub fn close_all(&mut self, rx: &mut Reactor) {
        for (_, queue) in self.pools.drain() {
            for session in queue {
                rx.do_io_close(session.chan);
                metrics().pooled_origin_sessions.dec();
            }
        }
    }
}

impl Continuation for SessionPool {
    /// Events here are the keep-alive watchdogs of parked sessions: any
    /// activity (bytes, EOS, error, idle timeout) means the session is no
    /// longer reusable.
    fn handle_event(&mut self, rx: &mut Reactor, event: Event, data: EventData) {
        if let Some(vio) = data.vio()
            && let Some(chan) = rx.vio_chan(vio)
        {
            tracing::debug!(?event, "Parked origin session closed by watchdog");
            self.evict_chan(rx, chan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::rc::Rc;
    use strata_io::ServiceMap;

    fn pool_with_reactor(max_idle: usize) -> (Reactor, Rc<RefCell<SessionPool>>) {
        let mut rx = Reactor::new();
        let pool = Rc::new(RefCell::new(SessionPool::new(max_idle, 60_000)));
        let cont = rx.register_cont(pool.clone());
        pool.borrow_mut().set_cont(cont);
        (rx, pool)
    }

    fn origin_chan(rx: &mut Reactor) -> ChanId {
        rx.new_buffered_channel(ServiceMap::new())
    }

    fn key() -> PoolKey {
        PoolKey::http1("10.0.0.1:80".parse().unwrap())
    }

    #[test]
    fn acquire_from_empty_pool_is_none() {
        let (mut rx, pool) = pool_with_reactor(4);
        assert!(pool.borrow_mut().acquire(&mut rx, &key()).is_none());
    }

    #[test]
    fn release_then_acquire_round_trips() {
        let (mut rx, pool) = pool_with_reactor(4);
        let chan = origin_chan(&mut rx);
        let session = ServerSession::new(chan, key());
        assert!(pool.borrow_mut().release(&mut rx, session));
        assert_eq!(pool.borrow().idle_count(), 1);

        let taken = pool.borrow_mut().acquire(&mut rx, &key()).unwrap();
        assert_eq!(taken.chan, chan);
        assert_eq!(taken.state, ServerSessionState::KaReserved);
        assert_eq!(pool.borrow().idle_count(), 0);
    }

    #[test]
    fn pool_keys_are_isolating() {
        let (mut rx, pool) = pool_with_reactor(4);
        let chan = origin_chan(&mut rx);
        pool.borrow_mut().release(&mut rx, ServerSession::new(chan, key()));
        let other = PoolKey {
            addr: "10.0.0.1:80".parse().unwrap(),
            sni: Some("secure.example".into()),
            proto: "http/1.1",
        };
        assert!(pool.borrow_mut().acquire(&mut rx, &other).is_none());
    }

    #[test]
    fn max_idle_overflow_closes_session() {
        let (mut rx, pool) = pool_with_reactor(1);
        let first = origin_chan(&mut rx);
        let second = origin_chan(&mut rx);
        assert!(pool.borrow_mut().release(&mut rx, ServerSession::new(first, key())));
        assert!(!pool.borrow_mut().release(&mut rx, ServerSession::new(second, key())));
        assert!(rx.chan_closed(second));
        assert_eq!(pool.borrow().idle_count(), 1);
    }

    #[test]
    fn origin_close_evicts_parked_session() {
        let (mut rx, pool) = pool_with_reactor(4);
        let chan = origin_chan(&mut rx);
        pool.borrow_mut().release(&mut rx, ServerSession::new(chan, key()));
        // Far side closes while parked: EOS hits the watchdog read.
        rx.feed_eos(chan);
        rx.run();
        assert_eq!(pool.borrow().idle_count(), 0);
        assert!(rx.chan_closed(chan));
    }

    #[test]
    fn unsolicited_bytes_evict_parked_session() {
        let (mut rx, pool) = pool_with_reactor(4);
        let chan = origin_chan(&mut rx);
        pool.borrow_mut().release(&mut rx, ServerSession::new(chan, key()));
        rx.feed(chan, Bytes::from_static(b"HTTP/1.1 408 Request Timeout\r\n\r\n"));
        rx.run();
        assert_eq!(pool.borrow().idle_count(), 0);
    }

    #[test]
    fn idle_timeout_evicts_parked_session() {
        let (mut rx, pool) = pool_with_reactor(4);
        let chan = origin_chan(&mut rx);
        pool.borrow_mut().release(&mut rx, ServerSession::new(chan, key()));
        rx.advance(60_000);
        rx.run();
        assert_eq!(pool.borrow().idle_count(), 0);
        assert!(rx.chan_closed(chan));
    }

    #[test]
    fn close_all_empties_pool() {
        let (mut rx, pool) = pool_with_reactor(4);
        let a = origin_chan(&mut rx);
        let b = origin_chan(&mut rx);
        pool.borrow_mut().release(&mut rx, ServerSession::new(a, key()));
        pool.borrow_mut().release(&mut rx, ServerSession::new(b, key()));
        pool.borrow_mut().close_all(&mut rx);
        assert_eq!(pool.borrow().idle_count(), 0);
        assert!(rx.chan_closed(a));
        assert!(rx.chan_closed(b));
    }
}
