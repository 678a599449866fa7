use crate::background::BackgroundRequest;
use crate::session::{ClientSession, SessionState};
use crate::txn::{ConnectResult, OriginConnector, ProcessCtx};
use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use strata_io::{Alpn, ChanId, ContId, Event, Reactor, ServiceMap};

const IO_TICK: std::time::Duration = std::time::Duration::from_millis(10);

/// Drive one accepted client socket against the worker's reactor: feed
/// inbound bytes into the session's channel, flush the channel's outbound
/// queue to the wire, and advance on idle ticks. All proxy logic runs
/// inside the reactor; this loop only moves bytes.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    reactor: Rc<RefCell<Reactor>>,
    process: Rc<ProcessCtx>,
    ssn_id: u64,
) -> anyhow::Result<()> {
    let (chan, session) = {
        let mut rx = reactor.borrow_mut();
        let mut services = ServiceMap::new();
        services.register(Alpn::http1());
        let chan = rx.new_buffered_channel(services);
        let session =
            ClientSession::new_connection(&mut rx, process, chan, Some(peer_addr), ssn_id);
        rx.run();
        (chan, session)
    };

    loop {
        flush_outbound(&reactor, chan, &mut stream).await?;
        {
            let rx = reactor.borrow();
            if rx.chan_closed(chan) {
                break;
            }
        }
        if session.borrow().state() == SessionState::Closed {
            break;
        }

        // A timed-out read drops the in-flight op together with its buffer
        // (io_uring owns it), so each attempt gets a fresh one.
        let read_buf = vec![0u8; 16 * 1024];
        match monoio::time::timeout(IO_TICK, stream.read(read_buf)).await {
            Ok((res, read_buf)) => {
                match res {
                    Ok(0) => {
                        let mut rx = reactor.borrow_mut();
                        rx.feed_eos(chan);
                        rx.run();
                        // Drain whatever the session still wants to say.
                        drop(rx);
                        flush_outbound(&reactor, chan, &mut stream).await?;
                        break;
                    }
                    Ok(n) => {
                        let mut rx = reactor.borrow_mut();
                        rx.feed(chan, Bytes::copy_from_slice(&read_buf[..n]));
                        rx.run();
                    }
                    Err(e) => {
                        let mut rx = reactor.borrow_mut();
                        rx.post_error(chan);
                        rx.run();
                        return Err(e.into());
                    }
                }
            }
            Err(_elapsed) => {
                // Idle tick; timers advance via the worker's clock task.
                let mut rx = reactor.borrow_mut();
                rx.run();
            }
        }
    }
    Ok(())
}

async fn flush_outbound(
    reactor: &Rc<RefCell<Reactor>>,
    chan: ChanId,
    stream: &mut TcpStream,
) -> anyhow::Result<()> {
    loop {
        let pending = {
            let mut rx = reactor.borrow_mut();
            rx.drain(chan)
        };
        if pending.is_empty() {
            return Ok(());
        }
        for seg in pending {
            let (res, _) = stream.write_all(seg.to_vec()).await;
            res?;
        }
    }
}

/// Production origin connector: dials a socket off the reactor thread's
/// executor and pumps it against a fresh buffered channel.
pub struct NetConnector {
    reactor: Rc<RefCell<Reactor>>,
}

impl NetConnector {
    pub fn new(reactor: Rc<RefCell<Reactor>>) -> Self {
        Self { reactor }
    }
}

impl OriginConnector for NetConnector {
    fn connect(&mut self, _rx: &mut Reactor, addr: SocketAddr, cont: ContId, token: u64) {
        let reactor = Rc::clone(&self.reactor);
        // The reactor is mid-dispatch here; the spawned task runs after it
        // quiesces, so all borrows below are fresh.
        monoio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let chan = {
                        let mut rx = reactor.borrow_mut();
                        let chan = rx.new_buffered_channel(ServiceMap::new());
                        rx.post_completion(
                            cont,
                            Event::ConnectDone,
                            ConnectResult { token, chan: Some(chan), error: None },
                        );
                        rx.run();
                        chan
                    };
                    if let Err(e) = pump_origin(reactor, chan, stream).await {
                        tracing::debug!(addr = %addr, error = %e, "Origin pump ended");
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "Origin connect failed");
                    let mut rx = reactor.borrow_mut();
                    rx.post_completion(
                        cont,
                        Event::ConnectDone,
                        ConnectResult { token, chan: None, error: Some(e.to_string()) },
                    );
                    rx.run();
                }
            }
        });
    }
}

async fn pump_origin(
    reactor: Rc<RefCell<Reactor>>,
    chan: ChanId,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    loop {
        // Flush request bytes toward the origin.
        loop {
            let pending = {
                let mut rx = reactor.borrow_mut();
                rx.drain(chan)
            };
            if pending.is_empty() {
                break;
            }
            for seg in pending {
                let (res, _) = stream.write_all(seg.to_vec()).await;
                res?;
            }
        }
        {
            let rx = reactor.borrow();
            if rx.chan_closed(chan) {
                return Ok(());
            }
        }
        let read_buf = vec![0u8; 64 * 1024];
        match monoio::time::timeout(IO_TICK, stream.read(read_buf)).await {
            Ok((res, read_buf)) => {
                match res {
                    Ok(0) => {
                        let mut rx = reactor.borrow_mut();
                        rx.feed_eos(chan);
                        rx.run();
                        return Ok(());
                    }
                    Ok(n) => {
                        let mut rx = reactor.borrow_mut();
                        rx.feed(chan, Bytes::copy_from_slice(&read_buf[..n]));
                        rx.run();
                    }
                    Err(e) => {
                        let mut rx = reactor.borrow_mut();
                        rx.post_error(chan);
                        rx.run();
                        return Err(e.into());
                    }
                }
            }
            Err(_elapsed) => {
                let mut rx = reactor.borrow_mut();
                rx.run();
            }
        }
    }
}

/// Run a plugin-scheduled background fetch as a synthetic transaction: an
/// in-memory client session whose request is the Range-stripped original
/// and whose response is discarded.
pub async fn pump_background_fetch(
    reactor: Rc<RefCell<Reactor>>,
    process: Rc<ProcessCtx>,
    request: BackgroundRequest,
    ssn_id: u64,
) {
    let chan = {
        let mut rx = reactor.borrow_mut();
        let chan = rx.new_buffered_channel(ServiceMap::new());
        let _session =
            ClientSession::new_connection(&mut rx, Rc::clone(&process), chan, None, ssn_id);
        let mut req = request.req.clone();
        req.fields.set("connection", "close");
        rx.feed(chan, Bytes::from(req.to_bytes()));
        rx.feed_eos(chan);
        rx.run();
        chan
    };
    loop {
        monoio::time::sleep(IO_TICK).await;
        let closed = {
            let mut rx = reactor.borrow_mut();
            let _ = rx.drain(chan);
            rx.run();
            rx.chan_closed(chan)
        };
        if closed {
            break;
        }
    }
    process.background.borrow().finish(&request.fingerprint);
}
