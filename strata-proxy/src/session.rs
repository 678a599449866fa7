use crate::metrics::metrics;
use crate::sm::HttpSM;
use crate::txn::{HookInvocation, ProcessCtx, SsnHandle};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;
use strata_hooks::{HookCursor, HookList, HookPoint};
use strata_io::buffer::BUFFER_SIZE_INDEX_8K;
use strata_io::{
    ChanId, ContId, Continuation, Event, EventData, IoBuffer, IoReader, Reactor, ShutdownSide,
    TlsBasic, UNBOUNDED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    /// Waiting for the first byte of the next request.
    KeepAlive,
    /// A transaction is in flight; HTTP/1 allows exactly one.
    ActiveReader,
    /// Write side shut, read side draining until timeout or EOS.
    HalfClosed,
    Closed,
}

/// How the state machine hands the connection back at transaction end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnDisposition {
    KeepAlive,
    HalfClose,
    Close,
}

/// An inbound HTTP/1 connection carrying one or more sequential
/// transactions. Owns the channel and its read buffer; spawns one state
/// machine per request.
pub struct ClientSession {
    pub id: u64,
    chan: ChanId,
    client_addr: Option<SocketAddr>,
    read_buf: IoBuffer,
    reader: IoReader,
    state: SessionState,
    transact_count: u64,
    released_transactions: u64,
    ssn_hooks: Rc<RefCell<HookList>>,
    process: Rc<ProcessCtx>,
    cont: Option<ContId>,
    weak_self: Weak<RefCell<ClientSession>>,
    /// SSN_START / SSN_CLOSE callout walk.
    callout: Option<(HookPoint, HookCursor)>,
    in_destroy: bool,
}

impl ClientSession {
    /// Accept a new connection: run SSN_START hooks, then wait for bytes.
    pub fn new_connection(
        rx: &mut Reactor,
        process: Rc<ProcessCtx>,
        chan: ChanId,
        client_addr: Option<SocketAddr>,
        id: u64,
    ) -> Rc<RefCell<ClientSession>> {
        let read_buf = IoBuffer::new(BUFFER_SIZE_INDEX_8K);
        let reader = read_buf.alloc_reader();
        let session = Rc::new(RefCell::new(Self {
            id,
            chan,
            client_addr,
            read_buf,
            reader,
            state: SessionState::Init,
            transact_count: 0,
            released_transactions: 0,
            ssn_hooks: Rc::new(RefCell::new(HookList::new())),
            process,
            cont: None,
            weak_self: Weak::new(),
            callout: None,
            in_destroy: false,
        }));
        session.borrow_mut().weak_self = Rc::downgrade(&session);
        let cont = rx.register_cont(session.clone());
        session.borrow_mut().cont = Some(cont);
        metrics().client_sessions.inc();
        tracing::debug!(ssn = id, "New client session");
        session.borrow_mut().do_api_callout(rx, HookPoint::SsnStart);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chan(&self) -> ChanId {
        self.chan
    }

    pub fn transaction_count(&self) -> u64 {
        self.transact_count
    }

    pub fn released_count(&self) -> u64 {
        self.released_transactions
    }

    pub fn ssn_hooks(&self) -> Rc<RefCell<HookList>> {
        Rc::clone(&self.ssn_hooks)
    }

    fn handle(&self) -> SsnHandle {
        SsnHandle {
            id: self.id,
            chan: self.chan,
            hooks: Rc::clone(&self.ssn_hooks),
            transaction_count: self.transact_count,
        }
    }

    fn do_api_callout(&mut self, rx: &mut Reactor, point: HookPoint) {
        let cursor = HookCursor::build(point, &self.ssn_hooks.borrow(), &self.process.global_hooks.borrow());
        self.callout = Some((point, cursor));
        self.advance_callout(rx);
    }

    fn advance_callout(&mut self, rx: &mut Reactor) {
        let (point, next) = match &mut self.callout {
            Some((point, cursor)) => (*point, cursor.next()),
            None => return,
        };
        if let Some(next) = next {
            let cont = self.cont.expect("session without cont");
            let invocation = HookInvocation::for_ssn(point, cont, self.handle());
            rx.cont_call(next, Event::Immediate, EventData::Opaque(Rc::new(invocation)));
            return;
        }
        self.callout = None;
        match point {
            HookPoint::SsnStart => self.enter_keep_alive(rx),
            HookPoint::SsnClose => self.finish_destroy(rx),
            _ => {}
        }
    }

    fn enter_keep_alive(&mut self, rx: &mut Reactor) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::KeepAlive;
        let cont = self.cont.expect("session without cont");
        rx.do_io_read(self.chan, cont, UNBOUNDED, self.read_buf.clone());
        rx.set_inactivity_timeout(self.chan, self.process.config.proxy.keep_alive_no_activity_ms);
        // Pipelined bytes from the previous transaction start the next one
        // without waiting for the wire.
        if self.reader.read_avail() > 0 {
            self.start_transaction(rx);
        }
    }

    fn start_transaction(&mut self, rx: &mut Reactor) {
        if self.state != SessionState::KeepAlive {
            return;
        }
        self.state = SessionState::ActiveReader;
        self.transact_count += 1;
        rx.cancel_inactivity_timeout(self.chan);
        let txn_id = self.transact_count;
        tracing::debug!(ssn = self.id, txn = txn_id, "Transaction start");
        HttpSM::spawn(
            rx,
            Rc::clone(&self.process),
            self.weak_self.clone(),
            self.chan,
            self.read_buf.clone(),
            self.reader.clone(),
            txn_id,
            self.client_addr,
        );
    }

    /// Called by the state machine when its transaction finishes. The
    /// session destroys itself only when every started transaction has been
    /// released.
    pub fn release_transaction(&mut self, rx: &mut Reactor, disposition: TxnDisposition) {
        self.released_transactions += 1;
        assert_eq!(
            self.transact_count, self.released_transactions,
            "transaction release out of order"
        );
        if self.state == SessionState::Closed {
            self.destroy(rx);
            return;
        }
        let draining = self.process.drain.load(Ordering::Relaxed);
        let disposition = if draining { TxnDisposition::Close } else { disposition };
        match disposition {
            TxnDisposition::KeepAlive => self.enter_keep_alive(rx),
            TxnDisposition::HalfClose => self.enter_half_close(rx),
            TxnDisposition::Close => {
                self.do_io_close(rx);
                self.destroy(rx);
            }
        }
    }

    /// Half-close: stop writing but keep draining client bytes (an upload
    /// may still be in flight behind an early error response). Forbidden on
    /// TLS channels, which cannot frame a one-sided close.
    pub fn half_close_allowed(&self, rx: &Reactor) -> bool {
        rx.get_service::<TlsBasic>(self.chan).is_none()
    }

    fn enter_half_close(&mut self, rx: &mut Reactor) {
        if !self.half_close_allowed(rx) {
            self.do_io_close(rx);
            self.destroy(rx);
            return;
        }
        self.state = SessionState::HalfClosed;
        rx.do_io_shutdown(self.chan, ShutdownSide::Write);
        let cont = self.cont.expect("session without cont");
        rx.do_io_read(self.chan, cont, UNBOUNDED, self.read_buf.clone());
        rx.set_inactivity_timeout(self.chan, self.process.config.proxy.keep_alive_no_activity_ms);
    }

    fn do_io_close(&mut self, rx: &mut Reactor) {
        if self.state != SessionState::Closed {
            rx.do_io_close(self.chan);
            self.state = SessionState::Closed;
        }
    }

    fn destroy(&mut self, rx: &mut Reactor) {
        if self.in_destroy {
            tracing::warn!(ssn = self.id, "Attempt to double ssn close");
            return;
        }
        if self.transact_count != self.released_transactions {
            return;
        }
        self.in_destroy = true;
        self.do_io_close(rx);
        self.do_api_callout(rx, HookPoint::SsnClose);
    }

    fn finish_destroy(&mut self, rx: &mut Reactor) {
        metrics().client_sessions.dec();
        tracing::debug!(ssn = self.id, txns = self.transact_count, "Session destroyed");
        if let Some(cont) = self.cont.take() {
            rx.unregister_cont(cont);
        }
    }
}

impl Continuation for ClientSession {
    fn handle_event(&mut self, rx: &mut Reactor, event: Event, _data: EventData) {
        match event {
            Event::ApiContinue => self.advance_callout(rx),
            Event::ApiError => {
                // A session hook rejecting the connection closes it.
                self.do_io_close(rx);
                self.destroy(rx);
            }
            Event::ReadReady => match self.state {
                SessionState::KeepAlive => self.start_transaction(rx),
                SessionState::HalfClosed => {
                    // Drain and discard; the client is finishing an upload
                    // nobody will read.
                    let avail = self.reader.read_avail();
                    if avail > 0 {
                        self.reader.consume(avail);
                    }
                }
                _ => {}
            },
            Event::Eos | Event::Error | Event::InactivityTimeout | Event::ActiveTimeout => {
                self.do_io_close(rx);
                self.destroy(rx);
            }
            _ => {}
        }
    }
}
