use crate::buffer::{IoBuffer, IoReader};
use crate::reactor::{ChanId, Reactor};
use std::any::Any;
use std::rc::Rc;

/// `nbytes` value meaning "read/write until EOS".
pub const UNBOUNDED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VioId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioDir {
    Read,
    Write,
}

/// Events delivered to continuations by the reactor.
///
/// Per VIO the order is `READY*` followed by exactly one terminal event
/// (`COMPLETE`, `EOS`, `ERROR` or a timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ReadReady,
    ReadComplete,
    WriteReady,
    WriteComplete,
    Eos,
    Error,
    InactivityTimeout,
    ActiveTimeout,
    /// Generic wakeup (`cont_call` with no I/O payload, channel close
    /// notification for callback channels).
    Immediate,
    /// Resolver completion; payload is an `Rc<HostLookupResult>`.
    HostLookup,
    /// Origin connector completion; payload is an `Rc<ConnectResult>`.
    ConnectDone,
    /// A hook callback asked the state machine to continue.
    ApiContinue,
    /// A hook callback reported an error; short-circuit to error emission.
    ApiError,
}

#[derive(Clone)]
pub enum EventData {
    None,
    Vio(VioId),
    Chan(ChanId),
    Opaque(Rc<dyn Any>),
}

impl EventData {
    pub fn vio(&self) -> Option<VioId> {
        match self {
            EventData::Vio(v) => Some(*v),
            _ => None,
        }
    }

    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        match self {
            EventData::Opaque(rc) => Rc::clone(rc).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EventData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventData::None => write!(f, "None"),
            EventData::Vio(v) => write!(f, "Vio({v:?})"),
            EventData::Chan(c) => write!(f, "Chan({c:?})"),
            EventData::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

/// A stateful callback registered with the reactor. Within one reactor all
/// deliveries are serialized, so a continuation never observes reentrancy.
pub trait Continuation {
    fn handle_event(&mut self, rx: &mut Reactor, event: Event, data: EventData);
}

/// One in-flight read or write intent on a channel.
pub struct Vio {
    pub id: VioId,
    pub chan: ChanId,
    pub dir: VioDir,
    pub nbytes: u64,
    pub ndone: u64,
    pub cont: ContId,
    /// Read side: destination buffer.
    pub buffer: Option<IoBuffer>,
    /// Write side: source reader.
    pub reader: Option<IoReader>,
    pub(crate) active: bool,
    pub(crate) eos_fired: bool,
}

impl Vio {
    pub fn todo(&self) -> u64 {
        self.nbytes.saturating_sub(self.ndone)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
