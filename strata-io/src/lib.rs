pub mod buffer;
pub mod event;
pub mod reactor;
pub mod services;
pub mod stek;

pub use buffer::{IoBuffer, IoReader};
pub use event::{ContId, Continuation, Event, EventData, VioDir, VioId, UNBOUNDED};
pub use reactor::{ChanId, Reactor, ShutdownSide};
pub use services::{Alpn, ProxyProtocolInfo, ServiceMap, TlsBasic, TlsEarlyData, TlsSessionResumption};
pub use stek::{StekStore, TicketKey};
