use crate::buffer::{IoBuffer, IoReader};
use crate::event::{ContId, Continuation, Event, EventData, Vio, VioDir, VioId};
use crate::services::ServiceMap;
use bytes::Bytes;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChanId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSide {
    Read,
    Write,
    Both,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VioState {
    Active,
    Done,
}

enum ChannelKind {
    /// Externally fed/drained endpoint: sockets, cache bodies, sinks.
    Buffered,
    /// Write side feeds its own read side (transform collector).
    Loopback,
    /// Write-side events are handed to an owning continuation which moves
    /// bytes itself (transforms).
    Callback { cont: ContId },
}

#[derive(Default)]
struct Pipe {
    inbound: VecDeque<Bytes>,
    inbound_eos: bool,
    outbound: VecDeque<Bytes>,
}

struct Timer {
    period_ms: u64,
    deadline_ms: u64,
}

struct Channel {
    kind: ChannelKind,
    pipe: Pipe,
    read_vio: Option<VioId>,
    write_vio: Option<VioId>,
    closed: bool,
    shut_read: bool,
    shut_write: bool,
    services: Rc<ServiceMap>,
    inactivity: Option<Timer>,
    active: Option<Timer>,
    dirty: bool,
}

struct Scheduled {
    cont: ContId,
    event: Event,
    data: EventData,
}

/// Single-threaded deterministic event loop. One reactor per worker thread;
/// continuations, channels and VIOs registered here never migrate, so event
/// handling inside one reactor is serialized by construction.
pub struct Reactor {
    conts: HashMap<u32, Rc<RefCell<dyn Continuation>>>,
    chans: HashMap<u32, Channel>,
    vios: HashMap<u32, (Vio, VioState, bool)>, // (vio, state, reenabled)
    queue: VecDeque<Scheduled>,
    calls: VecDeque<Scheduled>,
    dirty: Vec<ChanId>,
    next_id: u32,
    now_ms: u64,
    dispatching: bool,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            conts: HashMap::new(),
            chans: HashMap::new(),
            vios: HashMap::new(),
            queue: VecDeque::new(),
            calls: VecDeque::new(),
            dirty: Vec::new(),
            next_id: 1,
            now_ms: 0,
            dispatching: false,
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    // ── Continuations ─────────────────────────────────────────────

    pub fn register_cont(&mut self, cont: Rc<RefCell<dyn Continuation>>) -> ContId {
        let id = self.alloc_id();
        self.conts.insert(id, cont);
        ContId(id)
    }

    pub fn unregister_cont(&mut self, id: ContId) {
        self.conts.remove(&id.0);
    }

    /// Enqueue an event at the back of the queue.
    pub fn schedule(&mut self, cont: ContId, event: Event, data: EventData) {
        self.queue.push_back(Scheduled { cont, event, data });
    }

    /// Enqueue at the front: the deterministic stand-in for a synchronous
    /// continuation call (preserves call ordering without nested borrows).
    pub fn cont_call(&mut self, cont: ContId, event: Event, data: EventData) {
        self.calls.push_front(Scheduled { cont, event, data });
    }

    // ── Channels ──────────────────────────────────────────────────

    pub fn new_buffered_channel(&mut self, services: ServiceMap) -> ChanId {
        self.new_channel(ChannelKind::Buffered, services)
    }

    pub fn new_loopback_channel(&mut self) -> ChanId {
        self.new_channel(ChannelKind::Loopback, ServiceMap::new())
    }

    pub fn new_callback_channel(&mut self, cont: ContId) -> ChanId {
        self.new_channel(ChannelKind::Callback { cont }, ServiceMap::new())
    }

    fn new_channel(&mut self, kind: ChannelKind, services: ServiceMap) -> ChanId {
        let id = self.alloc_id();
        self.chans.insert(
            id,
            Channel {
                kind,
                pipe: Pipe::default(),
                read_vio: None,
                write_vio: None,
                closed: false,
                shut_read: false,
                shut_write: false,
                services: Rc::new(services),
                inactivity: None,
                active: None,
                dirty: false,
            },
        );
        ChanId(id)
    }

    pub fn is_chan_open(&self, chan: ChanId) -> bool {
        self.chans.get(&chan.0).is_some_and(|c| !c.closed)
    }

    pub fn chan_closed(&self, chan: ChanId) -> bool {
        !self.is_chan_open(chan)
    }

    pub fn get_service<T: 'static>(&self, chan: ChanId) -> Option<Rc<T>> {
        self.chans.get(&chan.0).and_then(|c| c.services.get::<T>())
    }

    fn mark_dirty(&mut self, chan: ChanId) {
        if let Some(c) = self.chans.get_mut(&chan.0)
            && !c.dirty
            && !c.closed
        {
            c.dirty = true;
            self.dirty.push(chan);
        }
    }

    // ── VIO operations ────────────────────────────────────────────

    pub fn do_io_read(&mut self, chan: ChanId, cont: ContId, nbytes: u64, buf: IoBuffer) -> VioId {
        let id = VioId(self.alloc_id());
        {
            let c = self.chans.get_mut(&chan.0).expect("do_io_read on dead channel");
            assert!(!c.closed, "do_io_read on closed channel");
            assert!(
                !matches!(c.kind, ChannelKind::Callback { .. }),
                "callback channels have no read side"
            );
            if let Some(old) = c.read_vio.take() {
                self.vios.remove(&old.0);
            }
            let c = self.chans.get_mut(&chan.0).unwrap();
            c.read_vio = Some(id);
        }
        let vio = Vio {
            id,
            chan,
            dir: VioDir::Read,
            nbytes,
            ndone: 0,
            cont,
            buffer: Some(buf),
            reader: None,
            active: true,
            eos_fired: false,
        };
        self.vios.insert(id.0, (vio, VioState::Active, true));
        self.mark_dirty(chan);
        id
    }

    pub fn do_io_write(
        &mut self,
        chan: ChanId,
        cont: ContId,
        nbytes: u64,
        reader: IoReader,
    ) -> VioId {
        let id = VioId(self.alloc_id());
        {
            let c = self.chans.get_mut(&chan.0).expect("do_io_write on dead channel");
            assert!(!c.closed, "do_io_write on closed channel");
            if let Some(old) = c.write_vio.take() {
                self.vios.remove(&old.0);
            }
            let c = self.chans.get_mut(&chan.0).unwrap();
            c.write_vio = Some(id);
        }
        let vio = Vio {
            id,
            chan,
            dir: VioDir::Write,
            nbytes,
            ndone: 0,
            cont,
            buffer: None,
            reader: Some(reader),
            active: true,
            eos_fired: false,
        };
        self.vios.insert(id.0, (vio, VioState::Active, true));
        self.mark_dirty(chan);
        id
    }

    /// Close the channel: cancels all VIOs and timers. No events are
    /// delivered for this channel afterwards.
    pub fn do_io_close(&mut self, chan: ChanId) {
        let Some(c) = self.chans.get_mut(&chan.0) else { return };
        if c.closed {
            return;
        }
        tracing::trace!(chan = chan.0, "Channel closed");
        c.closed = true;
        c.inactivity = None;
        c.active = None;
        let rv = c.read_vio.take();
        let wv = c.write_vio.take();
        let cb_cont = match c.kind {
            ChannelKind::Callback { cont } => Some(cont),
            _ => None,
        };
        if let Some(v) = rv {
            self.vios.remove(&v.0);
        }
        if let Some(v) = wv {
            self.vios.remove(&v.0);
        }
        // A callback channel owner still needs one wakeup to observe the
        // closed flag and tear itself down.
        if let Some(cont) = cb_cont {
            self.queue.push_back(Scheduled {
                cont,
                event: Event::Immediate,
                data: EventData::Chan(chan),
            });
        }
    }

    pub fn do_io_shutdown(&mut self, chan: ChanId, side: ShutdownSide) {
        let Some(c) = self.chans.get_mut(&chan.0) else { return };
        if matches!(side, ShutdownSide::Read | ShutdownSide::Both) {
            c.shut_read = true;
            if let Some(v) = c.read_vio.take() {
                self.vios.remove(&v.0);
            }
        }
        if matches!(side, ShutdownSide::Write | ShutdownSide::Both) {
            c.shut_write = true;
            if let Some(v) = c.write_vio.take() {
                self.vios.remove(&v.0);
            }
        }
    }

    /// Signal renewed interest in a VIO: the channel will deliver further
    /// READY events as data flows.
    pub fn reenable(&mut self, vio: VioId) {
        let Some((v, state, reenabled)) = self.vios.get_mut(&vio.0) else { return };
        if *state != VioState::Active {
            return;
        }
        *reenabled = true;
        let chan = v.chan;
        self.mark_dirty(chan);
    }

    // ── VIO accessors (used by tunnels and transforms) ────────────

    pub fn vio_nbytes(&self, vio: VioId) -> u64 {
        self.vios.get(&vio.0).map(|(v, ..)| v.nbytes).unwrap_or(0)
    }

    pub fn vio_ndone(&self, vio: VioId) -> u64 {
        self.vios.get(&vio.0).map(|(v, ..)| v.ndone).unwrap_or(0)
    }

    pub fn vio_todo(&self, vio: VioId) -> u64 {
        self.vios.get(&vio.0).map(|(v, ..)| v.todo()).unwrap_or(0)
    }

    pub fn vio_cont(&self, vio: VioId) -> Option<ContId> {
        self.vios.get(&vio.0).map(|(v, ..)| v.cont)
    }

    pub fn vio_chan(&self, vio: VioId) -> Option<ChanId> {
        self.vios.get(&vio.0).map(|(v, ..)| v.chan)
    }

    pub fn vio_reader(&self, vio: VioId) -> Option<IoReader> {
        self.vios.get(&vio.0).and_then(|(v, ..)| v.reader.clone())
    }

    pub fn vio_buffer(&self, vio: VioId) -> Option<IoBuffer> {
        self.vios.get(&vio.0).and_then(|(v, ..)| v.buffer.clone())
    }

    /// Extend or finalize a VIO's byte budget. Setting `nbytes` equal to the
    /// current `ndone` marks the operation finished on the next service pass.
    pub fn set_vio_nbytes(&mut self, vio: VioId, nbytes: u64) {
        if let Some((v, ..)) = self.vios.get_mut(&vio.0) {
            debug_assert!(nbytes >= v.ndone, "nbytes set below ndone");
            v.nbytes = nbytes;
            let chan = v.chan;
            self.mark_dirty(chan);
        }
    }

    /// Account bytes a callback-channel owner consumed from the write VIO.
    pub fn add_vio_ndone(&mut self, vio: VioId, n: u64) {
        if let Some((v, ..)) = self.vios.get_mut(&vio.0) {
            v.ndone += n;
            debug_assert!(v.ndone <= v.nbytes, "ndone advanced past nbytes");
        }
    }

    // ── External byte plumbing (net pump, cache, tests) ───────────

    pub fn feed(&mut self, chan: ChanId, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if let Some(c) = self.chans.get_mut(&chan.0) {
            if c.closed {
                return;
            }
            c.pipe.inbound.push_back(data);
        }
        self.mark_dirty(chan);
    }

    pub fn feed_eos(&mut self, chan: ChanId) {
        if let Some(c) = self.chans.get_mut(&chan.0) {
            if c.closed {
                return;
            }
            c.pipe.inbound_eos = true;
        }
        self.mark_dirty(chan);
    }

    /// Deliver a hard failure to every active VIO on the channel.
    pub fn post_error(&mut self, chan: ChanId) {
        let Some(c) = self.chans.get_mut(&chan.0) else { return };
        if c.closed {
            return;
        }
        tracing::trace!(chan = chan.0, "Channel error");
        let targets: Vec<VioId> = c.read_vio.iter().chain(c.write_vio.iter()).copied().collect();
        for vio in targets {
            if let Some((v, state, _)) = self.vios.get_mut(&vio.0)
                && *state == VioState::Active
            {
                *state = VioState::Done;
                let cont = v.cont;
                self.queue.push_back(Scheduled {
                    cont,
                    event: Event::Error,
                    data: EventData::Vio(vio),
                });
            }
        }
    }

    /// Take bytes queued for the wire (or for a sink consumer).
    pub fn drain(&mut self, chan: ChanId) -> Vec<Bytes> {
        match self.chans.get_mut(&chan.0) {
            Some(c) => c.pipe.outbound.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn outbound_len(&self, chan: ChanId) -> usize {
        self.chans
            .get(&chan.0)
            .map(|c| c.pipe.outbound.iter().map(|b| b.len()).sum())
            .unwrap_or(0)
    }

    // ── Timeouts ──────────────────────────────────────────────────

    pub fn set_inactivity_timeout(&mut self, chan: ChanId, ms: u64) {
        let now = self.now_ms;
        if let Some(c) = self.chans.get_mut(&chan.0) {
            c.inactivity = Some(Timer { period_ms: ms, deadline_ms: now + ms });
        }
    }

    pub fn set_active_timeout(&mut self, chan: ChanId, ms: u64) {
        let now = self.now_ms;
        if let Some(c) = self.chans.get_mut(&chan.0) {
            c.active = Some(Timer { period_ms: ms, deadline_ms: now + ms });
        }
    }

    pub fn cancel_inactivity_timeout(&mut self, chan: ChanId) {
        if let Some(c) = self.chans.get_mut(&chan.0) {
            c.inactivity = None;
        }
    }

    pub fn cancel_active_timeout(&mut self, chan: ChanId) {
        if let Some(c) = self.chans.get_mut(&chan.0) {
            c.active = None;
        }
    }

    /// Advance the reactor clock, firing any elapsed channel timers.
    pub fn advance(&mut self, dt_ms: u64) {
        self.now_ms += dt_ms;
        let now = self.now_ms;
        let mut firings: Vec<(VioId, Event)> = Vec::new();
        for c in self.chans.values_mut() {
            if c.closed {
                continue;
            }
            let mut fire = |timer: &mut Option<Timer>, event: Event, c_read: Option<VioId>, c_write: Option<VioId>, out: &mut Vec<(VioId, Event)>| {
                if let Some(t) = timer
                    && t.deadline_ms <= now
                {
                    *timer = None;
                    for vio in c_read.iter().chain(c_write.iter()) {
                        out.push((*vio, event));
                    }
                }
            };
            fire(&mut c.inactivity, Event::InactivityTimeout, c.read_vio, c.write_vio, &mut firings);
            fire(&mut c.active, Event::ActiveTimeout, c.read_vio, c.write_vio, &mut firings);
        }
        for (vio, event) in firings {
            if let Some((v, state, _)) = self.vios.get_mut(&vio.0)
                && *state == VioState::Active
            {
                let cont = v.cont;
                self.queue.push_back(Scheduled { cont, event, data: EventData::Vio(vio) });
            }
        }
    }

    fn touch_inactivity(&mut self, chan: ChanId) {
        let now = self.now_ms;
        if let Some(c) = self.chans.get_mut(&chan.0)
            && let Some(t) = &mut c.inactivity
        {
            t.deadline_ms = now + t.period_ms;
        }
    }

    // ── Pump & dispatch ───────────────────────────────────────────

    fn fire(&mut self, cont: ContId, event: Event, vio: VioId) {
        self.queue.push_back(Scheduled { cont, event, data: EventData::Vio(vio) });
    }

    fn pump_chan(&mut self, chan: ChanId) {
        let Some(c) = self.chans.get(&chan.0) else { return };
        if c.closed {
            return;
        }
        if let ChannelKind::Callback { cont } = c.kind {
            // Hand reenabled write VIOs to the owning continuation; it moves
            // the bytes itself.
            if let Some(wv) = c.write_vio
                && let Some((v, state, reenabled)) = self.vios.get_mut(&wv.0)
                && *state == VioState::Active
                && *reenabled
                && v.dir == VioDir::Write
            {
                *reenabled = false;
                self.fire(cont, Event::WriteReady, wv);
            }
            return;
        }
        let loopback = matches!(c.kind, ChannelKind::Loopback);

        // Write side first so a loopback's read side sees fresh bytes in the
        // same pass.
        let wv = c.write_vio;
        let shut_write = c.shut_write;
        if let Some(wv) = wv {
            let mut moved = 0usize;
            let mut fire_complete = false;
            let mut fire_ready = false;
            let mut cont = None;
            if let Some((v, state, reenabled)) = self.vios.get_mut(&wv.0)
                && *state == VioState::Active
                && !shut_write
            {
                cont = Some(v.cont);
                let was_reenabled = *reenabled;
                *reenabled = false;
                let reader = v.reader.as_ref().expect("write vio without reader");
                let avail = reader.read_avail() as u64;
                let n = avail.min(v.todo()) as usize;
                let segs = if n > 0 { reader.take_bytes(n) } else { Vec::new() };
                v.ndone += n as u64;
                moved = n;
                fire_complete = v.ndone == v.nbytes;
                fire_ready = !fire_complete && (n > 0 || was_reenabled);
                if fire_complete {
                    *state = VioState::Done;
                }
                let c = self.chans.get_mut(&chan.0).unwrap();
                for seg in segs {
                    if loopback {
                        c.pipe.inbound.push_back(seg);
                    } else {
                        c.pipe.outbound.push_back(seg);
                    }
                }
                if loopback && fire_complete {
                    c.pipe.inbound_eos = true;
                }
            }
            if moved > 0 {
                self.touch_inactivity(chan);
            }
            if let Some(cont) = cont {
                if fire_complete {
                    self.fire(cont, Event::WriteComplete, wv);
                } else if fire_ready {
                    self.fire(cont, Event::WriteReady, wv);
                }
            }
        }

        let rv = self.chans.get(&chan.0).and_then(|c| c.read_vio);
        if let Some(rv) = rv {
            let shut = self.chans[&chan.0].shut_read;
            let mut fire_ready = false;
            let mut fire_complete = false;
            let mut fire_eos = false;
            let mut moved = 0usize;
            let mut cont = None;
            if let Some((v, state, reenabled)) = self.vios.get_mut(&rv.0)
                && *state == VioState::Active
                && !shut
            {
                cont = Some(v.cont);
                let buf = v.buffer.clone().expect("read vio without buffer");
                let c = self.chans.get_mut(&chan.0).unwrap();
                let mut todo = v.nbytes - v.ndone;
                while todo > 0 {
                    let Some(seg) = c.pipe.inbound.pop_front() else { break };
                    let take = (seg.len() as u64).min(todo) as usize;
                    if take < seg.len() {
                        c.pipe.inbound.push_front(seg.slice(take..));
                    }
                    buf.append_bytes(seg.slice(..take));
                    v.ndone += take as u64;
                    todo -= take as u64;
                    moved += take;
                }
                if v.ndone == v.nbytes {
                    fire_complete = true;
                    *state = VioState::Done;
                } else if c.pipe.inbound.is_empty() && c.pipe.inbound_eos && !v.eos_fired {
                    v.eos_fired = true;
                    fire_eos = true;
                    *state = VioState::Done;
                } else if (moved > 0 || *reenabled) && buf.max_read_avail() > 0 && buf.water_mark_reached() {
                    fire_ready = true;
                    *reenabled = false;
                }
            }
            if moved > 0 {
                self.touch_inactivity(chan);
            }
            if let Some(cont) = cont {
                if fire_complete {
                    self.fire(cont, Event::ReadComplete, rv);
                } else if fire_eos {
                    self.fire(cont, Event::Eos, rv);
                } else if fire_ready {
                    self.fire(cont, Event::ReadReady, rv);
                }
            }
        }
    }

    fn pump_dirty(&mut self) {
        while let Some(chan) = self.dirty.pop() {
            if let Some(c) = self.chans.get_mut(&chan.0) {
                c.dirty = false;
            }
            self.pump_chan(chan);
        }
    }

    fn pop_scheduled(&mut self) -> Option<Scheduled> {
        self.calls.pop_front().or_else(|| self.queue.pop_front())
    }

    fn deliverable(&self, s: &Scheduled) -> bool {
        if !self.conts.contains_key(&s.cont.0) {
            return false;
        }
        match &s.data {
            EventData::Vio(v) => match self.vios.get(&v.0) {
                Some((vio, ..)) => self.is_chan_open(vio.chan),
                None => false,
            },
            _ => true,
        }
    }

    /// Drain the event queue, pumping channels between deliveries, until the
    /// reactor is quiescent. Must not be called from inside a handler.
    pub fn run(&mut self) {
        assert!(!self.dispatching, "Reactor::run re-entered from a handler");
        loop {
            self.pump_dirty();
            let Some(s) = self.pop_scheduled() else {
                if self.dirty.is_empty() {
                    break;
                }
                continue;
            };
            if !self.deliverable(&s) {
                continue;
            }
            let cont = Rc::clone(&self.conts[&s.cont.0]);
            self.dispatching = true;
            cont.borrow_mut().handle_event(self, s.event, s.data);
            self.dispatching = false;
        }
    }

    /// Post an opaque completion (resolver results, connect results).
    pub fn post_completion<T: 'static>(&mut self, cont: ContId, event: Event, payload: T) {
        let data: Rc<dyn Any> = Rc::new(payload);
        self.schedule(cont, event, EventData::Opaque(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUFFER_SIZE_INDEX_4K;
    use crate::event::UNBOUNDED;

    /// Records every event it sees; optionally consumes its read buffer.
    struct Probe {
        events: Vec<Event>,
        reader: Option<IoReader>,
        consumed: Vec<u8>,
        auto_reenable: bool,
    }

    impl Probe {
        fn new() -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                events: Vec::new(),
                reader: None,
                consumed: Vec::new(),
                auto_reenable: false,
            }))
        }
    }

    impl Continuation for Probe {
        fn handle_event(&mut self, rx: &mut Reactor, event: Event, data: EventData) {
            self.events.push(event);
            if matches!(event, Event::ReadReady | Event::ReadComplete | Event::Eos)
                && let Some(reader) = &self.reader
            {
                self.consumed.extend(reader.read_all());
            }
            if self.auto_reenable
                && event == Event::ReadReady
                && let Some(v) = data.vio()
            {
                rx.reenable(v);
            }
        }
    }

    fn setup() -> (Reactor, Rc<RefCell<Probe>>, ContId, ChanId) {
        let mut rx = Reactor::new();
        let probe = Probe::new();
        let cont = rx.register_cont(probe.clone());
        let chan = rx.new_buffered_channel(ServiceMap::new());
        (rx, probe, cont, chan)
    }

    #[test]
    fn read_ready_then_complete_in_order() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        probe.borrow_mut().reader = Some(reader);
        probe.borrow_mut().auto_reenable = true;
        rx.do_io_read(chan, cont, 10, buf);
        rx.feed(chan, Bytes::from_static(b"12345"));
        rx.run();
        rx.feed(chan, Bytes::from_static(b"67890"));
        rx.run();
        let events = probe.borrow().events.clone();
        assert_eq!(events, vec![Event::ReadReady, Event::ReadComplete]);
        assert_eq!(probe.borrow().consumed, b"1234567890");
    }

    #[test]
    fn done_never_exceeds_nbytes() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        probe.borrow_mut().reader = Some(reader);
        let vio = rx.do_io_read(chan, cont, 4, buf);
        rx.feed(chan, Bytes::from_static(b"123456789"));
        rx.run();
        assert_eq!(rx.vio_ndone(vio), 4);
        assert_eq!(rx.vio_nbytes(vio), 4);
        // The overflow bytes stay queued for the next read intent.
        assert_eq!(probe.borrow().consumed, b"1234");
    }

    #[test]
    fn eos_fires_after_peer_close() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        probe.borrow_mut().reader = Some(buf.alloc_reader());
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.feed(chan, Bytes::from_static(b"partial"));
        rx.run();
        rx.feed_eos(chan);
        rx.run();
        let events = probe.borrow().events.clone();
        assert_eq!(*events.last().unwrap(), Event::Eos);
        assert_eq!(probe.borrow().consumed, b"partial");
    }

    #[test]
    fn no_events_after_close() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.feed(chan, Bytes::from_static(b"data"));
        rx.do_io_close(chan);
        rx.run();
        assert!(probe.borrow().events.is_empty(), "closed channel delivered events");
    }

    #[test]
    fn write_vio_moves_bytes_to_outbound() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        buf.write(b"response-bytes");
        rx.do_io_write(chan, cont, 14, reader);
        rx.run();
        let out: Vec<u8> = rx.drain(chan).iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(out, b"response-bytes");
        assert_eq!(probe.borrow().events, vec![Event::WriteComplete]);
    }

    #[test]
    fn write_ready_asks_for_more_data() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        buf.write(b"first");
        let vio = rx.do_io_write(chan, cont, 10, reader);
        rx.run();
        assert_eq!(probe.borrow().events, vec![Event::WriteReady]);
        buf.write(b"-more");
        rx.reenable(vio);
        rx.run();
        assert_eq!(
            probe.borrow().events,
            vec![Event::WriteReady, Event::WriteComplete]
        );
    }

    #[test]
    fn water_mark_suppresses_ready_until_reached() {
        let (mut rx, probe, cont, chan) = setup();
        // Water-mark equal to a full block: READY must not fire below it.
        let buf = IoBuffer::with_water_mark(0, 128);
        probe.borrow_mut().reader = Some(buf.alloc_reader());
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.feed(chan, Bytes::from(vec![0u8; 127]));
        rx.run();
        assert!(probe.borrow().events.is_empty(), "READY below water-mark");
        rx.feed(chan, Bytes::from(vec![0u8; 1]));
        rx.run();
        assert_eq!(probe.borrow().events, vec![Event::ReadReady]);
    }

    #[test]
    fn shutdown_read_keeps_write_side_usable() {
        let (mut rx, probe, cont, chan) = setup();
        let rbuf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(chan, cont, UNBOUNDED, rbuf);
        rx.do_io_shutdown(chan, ShutdownSide::Read);
        rx.feed(chan, Bytes::from_static(b"ignored"));
        rx.run();
        assert!(probe.borrow().events.is_empty());

        let wbuf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = wbuf.alloc_reader();
        wbuf.write(b"still-writable");
        rx.do_io_write(chan, cont, 14, reader);
        rx.run();
        assert_eq!(probe.borrow().events, vec![Event::WriteComplete]);
        assert_eq!(rx.outbound_len(chan), 14);
    }

    #[test]
    fn inactivity_timeout_fires_on_idle_channel() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.set_inactivity_timeout(chan, 1000);
        rx.advance(999);
        rx.run();
        assert!(probe.borrow().events.is_empty());
        rx.advance(1);
        rx.run();
        assert_eq!(probe.borrow().events, vec![Event::InactivityTimeout]);
    }

    #[test]
    fn byte_flow_resets_inactivity_timer() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        probe.borrow_mut().reader = Some(buf.alloc_reader());
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.set_inactivity_timeout(chan, 1000);
        rx.advance(900);
        rx.feed(chan, Bytes::from_static(b"x"));
        rx.run();
        rx.advance(900);
        rx.run();
        let events = probe.borrow().events.clone();
        assert!(!events.contains(&Event::InactivityTimeout), "timer was not reset by byte flow");
    }

    #[test]
    fn close_cancels_timers() {
        let (mut rx, probe, cont, chan) = setup();
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(chan, cont, UNBOUNDED, buf);
        rx.set_active_timeout(chan, 10);
        rx.do_io_close(chan);
        rx.advance(100);
        rx.run();
        assert!(probe.borrow().events.is_empty());
    }

    #[test]
    fn loopback_write_side_feeds_read_side() {
        let mut rx = Reactor::new();
        let probe = Probe::new();
        let cont = rx.register_cont(probe.clone());
        let chan = rx.new_loopback_channel();

        let out_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let out_reader = out_buf.alloc_reader();
        out_buf.write(b"looped");
        rx.do_io_write(chan, cont, 6, out_reader);

        let in_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        probe.borrow_mut().reader = Some(in_buf.alloc_reader());
        rx.do_io_read(chan, cont, UNBOUNDED, in_buf);
        rx.run();
        assert_eq!(probe.borrow().consumed, b"looped");
        let events = probe.borrow().events.clone();
        assert!(events.contains(&Event::WriteComplete));
        assert_eq!(*events.last().unwrap(), Event::Eos);
    }

    #[test]
    fn post_error_reaches_every_active_vio() {
        let (mut rx, probe, cont, chan) = setup();
        let rbuf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_read(chan, cont, UNBOUNDED, rbuf);
        let wbuf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        rx.do_io_write(chan, cont, UNBOUNDED, wbuf.alloc_reader());
        rx.run();
        rx.post_error(chan);
        rx.run();
        let errors = probe.borrow().events.iter().filter(|e| **e == Event::Error).count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn callback_channel_routes_write_events_to_owner() {
        let mut rx = Reactor::new();
        let owner = Probe::new();
        let owner_id = rx.register_cont(owner.clone());
        let upstream = Probe::new();
        let upstream_id = rx.register_cont(upstream.clone());
        let chan = rx.new_callback_channel(owner_id);

        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        buf.write(b"input");
        rx.do_io_write(chan, upstream_id, 5, buf.alloc_reader());
        rx.run();
        // The channel owner, not the VIO continuation, sees the write event.
        assert_eq!(owner.borrow().events, vec![Event::WriteReady]);
        assert!(upstream.borrow().events.is_empty());
    }

    #[test]
    fn callback_channel_close_wakes_owner_once() {
        let mut rx = Reactor::new();
        let owner = Probe::new();
        let owner_id = rx.register_cont(owner.clone());
        let chan = rx.new_callback_channel(owner_id);
        rx.do_io_close(chan);
        rx.run();
        assert_eq!(owner.borrow().events, vec![Event::Immediate]);
        assert!(rx.chan_closed(chan));
    }
}
