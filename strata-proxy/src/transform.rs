use crate::txn::TxnCtx;
use std::cell::RefCell;
use std::rc::Rc;
use strata_io::buffer::BUFFER_SIZE_INDEX_4K;
use strata_io::{
    ChanId, ContId, Continuation, Event, EventData, IoBuffer, Reactor, VioId, UNBOUNDED,
};

/// Create a transform endpoint: a callback channel whose write-side events
/// are delivered to `cont`. The plugin registers the returned channel on
/// the transaction with `add_response_transform`.
pub fn transform_create(
    rx: &mut Reactor,
    cont: Rc<RefCell<dyn Continuation>>,
) -> (ChanId, ContId) {
    let cont_id = rx.register_cont(cont);
    let chan = rx.new_callback_channel(cont_id);
    (chan, cont_id)
}

/// Wire the transaction's transforms into a chain: each transform's output
/// is the next transform's channel; the last one writes into a fresh
/// loopback collector the tunnel reads from. Returns `(first, collector)`,
/// or `None` when no transforms are registered (identity).
pub fn build_chain(rx: &mut Reactor, ctx: &Rc<RefCell<TxnCtx>>) -> Option<(ChanId, ChanId)> {
    let transforms = ctx.borrow().transforms.clone();
    if transforms.is_empty() {
        return None;
    }
    let collector = rx.new_loopback_channel();
    let outputs: Vec<(ChanId, ChanId)> = transforms
        .iter()
        .enumerate()
        .map(|(i, (chan, _))| {
            let out = if i + 1 < transforms.len() { transforms[i + 1].0 } else { collector };
            (*chan, out)
        })
        .collect();
    ctx.borrow_mut().transform_outputs = outputs;
    Some((transforms[0].0, collector))
}

/// A response-body transform applying `f` per input chunk, with an optional
/// trailing epilogue. Follows the transform contract: output buffer and
/// downstream VIO are allocated lazily on the first event; the output VIO's
/// `nbytes` is fixed once the input is exhausted; the upstream writer is
/// called back with WRITE_READY / WRITE_COMPLETE as bytes move.
pub struct ByteTransform<F: FnMut(&[u8]) -> Vec<u8>> {
    ctx: Rc<RefCell<TxnCtx>>,
    f: F,
    epilogue: Vec<u8>,
    pub chan: Option<ChanId>,
    cont: Option<ContId>,
    out_buf: Option<IoBuffer>,
    out_vio: Option<VioId>,
    input_vio: Option<VioId>,
    produced: u64,
    finished: bool,
    destroyed: bool,
}

impl<F: FnMut(&[u8]) -> Vec<u8>> ByteTransform<F> {
    pub fn new(ctx: Rc<RefCell<TxnCtx>>, f: F) -> Self {
        Self::with_epilogue(ctx, f, Vec::new())
    }

    pub fn with_epilogue(ctx: Rc<RefCell<TxnCtx>>, f: F, epilogue: Vec<u8>) -> Self {
        Self {
            ctx,
            f,
            epilogue,
            chan: None,
            cont: None,
            out_buf: None,
            out_vio: None,
            input_vio: None,
            produced: 0,
            finished: false,
            destroyed: false,
        }
    }

    /// Build, register, and attach to the transaction in one step.
    pub fn install(rx: &mut Reactor, ctx: &Rc<RefCell<TxnCtx>>, f: F) -> ChanId
    where
        F: 'static,
    {
        Self::install_with_epilogue(rx, ctx, f, Vec::new())
    }

    pub fn install_with_epilogue(
        rx: &mut Reactor,
        ctx: &Rc<RefCell<TxnCtx>>,
        f: F,
        epilogue: Vec<u8>,
    ) -> ChanId
    where
        F: 'static,
    {
        let transform = Rc::new(RefCell::new(Self::with_epilogue(Rc::clone(ctx), f, epilogue)));
        let (chan, cont) = transform_create(rx, transform.clone());
        {
            let mut t = transform.borrow_mut();
            t.chan = Some(chan);
            t.cont = Some(cont);
        }
        ctx.borrow_mut().add_response_transform(chan, cont);
        chan
    }

    fn destroy(&mut self, rx: &mut Reactor) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(cont) = self.cont {
            rx.unregister_cont(cont);
        }
        self.out_buf = None;
    }

    fn handle_transform(&mut self, rx: &mut Reactor, write_vio: VioId) {
        if self.finished {
            return;
        }
        self.input_vio = Some(write_vio);

        if self.out_vio.is_none() {
            let Some(out_chan) = self.chan.and_then(|c| self.ctx.borrow().transform_output(c))
            else {
                tracing::warn!("transform has no output wiring; dropping event");
                return;
            };
            let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
            let reader = buf.alloc_reader();
            let cont = self.cont.expect("transform without cont id");
            self.out_vio = Some(rx.do_io_write(out_chan, cont, UNBOUNDED, reader));
            self.out_buf = Some(buf);
        }
        let out_vio = self.out_vio.expect("output vio");

        let Some(reader) = rx.vio_reader(write_vio) else { return };
        let avail = reader.read_avail();
        let todo = rx.vio_todo(write_vio);
        let take = avail.min(todo as usize);
        if take > 0 {
            let mut chunk = vec![0u8; take];
            reader.read(&mut chunk);
            let transformed = (self.f)(&chunk);
            self.produced += transformed.len() as u64;
            self.out_buf.as_ref().expect("output buffer").write(&transformed);
            rx.add_vio_ndone(write_vio, take as u64);
        }

        let upstream = rx.vio_cont(write_vio);
        if rx.vio_todo(write_vio) > 0 {
            if take > 0 {
                rx.reenable(out_vio);
                if let Some(upstream) = upstream {
                    rx.cont_call(upstream, Event::WriteReady, EventData::Vio(write_vio));
                }
            }
        } else {
            self.finished = true;
            if !self.epilogue.is_empty() {
                self.produced += self.epilogue.len() as u64;
                self.out_buf.as_ref().expect("output buffer").write(&self.epilogue);
            }
            rx.set_vio_nbytes(out_vio, self.produced);
            rx.reenable(out_vio);
            if let Some(upstream) = upstream {
                rx.cont_call(upstream, Event::WriteComplete, EventData::Vio(write_vio));
            }
        }
    }
}

impl<F: FnMut(&[u8]) -> Vec<u8>> Continuation for ByteTransform<F> {
    fn handle_event(&mut self, rx: &mut Reactor, event: Event, data: EventData) {
        if let Some(chan) = self.chan
            && rx.chan_closed(chan)
        {
            self.destroy(rx);
            return;
        }
        match event {
            Event::Error => {
                // Propagate upstream, toward the writer feeding us.
                if let Some(input) = self.input_vio
                    && let Some(upstream) = rx.vio_cont(input)
                {
                    rx.cont_call(upstream, Event::Error, EventData::Vio(input));
                }
                self.finished = true;
            }
            Event::WriteComplete => {
                // Downstream consumed everything we will produce.
                if data.vio() == self.out_vio
                    && let Some(out_vio) = self.out_vio
                    && let Some(chan) = rx.vio_chan(out_vio)
                {
                    rx.do_io_shutdown(chan, strata_io::ShutdownSide::Write);
                }
            }
            _ => {
                // Events for the output VIO ("I can take more") need no
                // action; we push eagerly. Everything else is input flow.
                let vio = data.vio().or(self.input_vio);
                if let Some(vio) = vio
                    && Some(vio) != self.out_vio
                {
                    self.handle_transform(rx, vio);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_io::UNBOUNDED;

    struct Upstream {
        events: Vec<Event>,
    }

    impl Continuation for Upstream {
        fn handle_event(&mut self, _: &mut Reactor, event: Event, _: EventData) {
            self.events.push(event);
        }
    }

    struct Harness {
        rx: Reactor,
        ctx: Rc<RefCell<TxnCtx>>,
        upstream: Rc<RefCell<Upstream>>,
        upstream_id: ContId,
    }

    fn harness() -> Harness {
        let mut rx = Reactor::new();
        let ctx = Rc::new(RefCell::new(TxnCtx::new(1, None)));
        let upstream = Rc::new(RefCell::new(Upstream { events: Vec::new() }));
        let upstream_id = rx.register_cont(upstream.clone());
        Harness { rx, ctx, upstream, upstream_id }
    }

    /// Drive `input` through the chain and return what reached the
    /// collector.
    fn run_chain(h: &mut Harness, input: &[u8]) -> Vec<u8> {
        let (first, collector) = build_chain(&mut h.rx, &h.ctx).expect("chain");
        let in_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let in_reader = in_buf.alloc_reader();
        in_buf.write(input);
        let first_vio =
            h.rx.do_io_write(first, h.upstream_id, input.len() as u64, in_reader);

        let out_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let out_reader = out_buf.alloc_reader();
        h.rx.do_io_read(collector, h.upstream_id, UNBOUNDED, out_buf);
        h.rx.run();
        let _ = first_vio;
        out_reader.read_all()
    }

    #[test]
    fn single_transform_maps_bytes() {
        let mut h = harness();
        ByteTransform::install(&mut h.rx, &h.ctx, |chunk| chunk.to_ascii_uppercase());
        let out = run_chain(&mut h, b"hello world");
        assert_eq!(out, b"HELLO WORLD");
        let events = h.upstream.borrow().events.clone();
        assert!(events.contains(&Event::WriteComplete), "upstream must see WRITE_COMPLETE");
    }

    #[test]
    fn epilogue_is_appended_once_at_end() {
        let mut h = harness();
        ByteTransform::install_with_epilogue(
            &mut h.rx,
            &h.ctx,
            |chunk| chunk.to_vec(),
            b"\nThis is a transformed response".to_vec(),
        );
        let out = run_chain(&mut h, b"original");
        assert_eq!(out, b"original\nThis is a transformed response");
    }

    #[test]
    fn two_transforms_chain_in_registration_order() {
        let mut h = harness();
        ByteTransform::install_with_epilogue(
            &mut h.rx,
            &h.ctx,
            |chunk| chunk.to_vec(),
            b"-first".to_vec(),
        );
        ByteTransform::install_with_epilogue(
            &mut h.rx,
            &h.ctx,
            |chunk| chunk.to_vec(),
            b"-second".to_vec(),
        );
        // The first transform's epilogue passes through the second, so the
        // second's epilogue lands last.
        let out = run_chain(&mut h, b"body");
        assert_eq!(out, b"body-first-second");
    }

    #[test]
    fn incremental_input_is_flushed_per_chunk() {
        let mut h = harness();
        ByteTransform::install(&mut h.rx, &h.ctx, |chunk| chunk.to_vec());
        let (first, collector) = build_chain(&mut h.rx, &h.ctx).expect("chain");

        let in_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let in_reader = in_buf.alloc_reader();
        let first_vio = h.rx.do_io_write(first, h.upstream_id, UNBOUNDED, in_reader);

        let out_buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let out_reader = out_buf.alloc_reader();
        h.rx.do_io_read(collector, h.upstream_id, UNBOUNDED, out_buf);

        in_buf.write(b"chunk-1");
        h.rx.reenable(first_vio);
        h.rx.run();
        assert_eq!(out_reader.read_all(), b"chunk-1");

        in_buf.write(b"chunk-2");
        h.rx.reenable(first_vio);
        h.rx.run();
        assert_eq!(out_reader.read_all(), b"chunk-2");

        // Finalize: fix nbytes at what was written, then reenable.
        h.rx.set_vio_nbytes(first_vio, 14);
        h.rx.reenable(first_vio);
        h.rx.run();
        assert!(h.upstream.borrow().events.contains(&Event::WriteComplete));
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut h = harness();
        assert!(build_chain(&mut h.rx, &h.ctx).is_none());
    }

    #[test]
    fn closing_the_transform_channel_destroys_it() {
        let mut h = harness();
        let chan = ByteTransform::install(&mut h.rx, &h.ctx, |c| c.to_vec());
        build_chain(&mut h.rx, &h.ctx);
        h.rx.do_io_close(chan);
        h.rx.run();
        // A post-close event must be ignored (the continuation destroyed
        // itself); nothing to assert beyond "no panic".
    }
}
