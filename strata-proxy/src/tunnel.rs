use strata_core::ProxyError;
use strata_core::http::{BodyFraming, ChunkedDecoder};
use strata_io::buffer::BUFFER_SIZE_INDEX_8K;
use strata_io::{IoBuffer, IoReader, Reactor, VioId};

/// Decodes a response (or request) body out of a raw channel buffer
/// according to its framing, producing identity bytes in `out`.
pub struct BodySource {
    framing: BodyFraming,
    raw_reader: IoReader,
    pub out: IoBuffer,
    decoder: Option<ChunkedDecoder>,
    pub produced: u64,
    pub done: bool,
    pub truncated: bool,
}

impl BodySource {
    pub fn new(framing: BodyFraming, raw_reader: IoReader) -> Self {
        let decoder = match framing {
            BodyFraming::Chunked => Some(ChunkedDecoder::new()),
            _ => None,
        };
        let done = matches!(framing, BodyFraming::None)
            || matches!(framing, BodyFraming::ContentLength(0));
        Self {
            framing,
            raw_reader,
            out: IoBuffer::new(BUFFER_SIZE_INDEX_8K),
            decoder,
            produced: 0,
            done,
            truncated: false,
        }
    }

    pub fn expected(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::ContentLength(n) => Some(n),
            BodyFraming::None => Some(0),
            _ => None,
        }
    }

    /// Move newly arrived raw bytes into `out`. Returns bytes produced.
    pub fn pump(&mut self) -> Result<u64, ProxyError> {
        if self.done {
            return Ok(0);
        }
        let before = self.produced;
        match self.framing {
            BodyFraming::None => {}
            BodyFraming::ContentLength(total) => {
                let want = (total - self.produced) as usize;
                let take = want.min(self.raw_reader.read_avail());
                if take > 0 {
                    for seg in self.raw_reader.take_bytes(take) {
                        self.out.append_bytes(seg);
                    }
                    self.produced += take as u64;
                }
                if self.produced == total {
                    self.done = true;
                }
            }
            BodyFraming::CloseDelimited => {
                let avail = self.raw_reader.read_avail();
                if avail > 0 {
                    for seg in self.raw_reader.take_bytes(avail) {
                        self.out.append_bytes(seg);
                    }
                    self.produced += avail as u64;
                }
            }
            BodyFraming::Chunked => {
                let avail = self.raw_reader.read_avail();
                if avail > 0 {
                    let mut raw = vec![0u8; avail];
                    self.raw_reader.read(&mut raw);
                    let mut decoded = Vec::new();
                    let decoder = self.decoder.as_mut().expect("chunked without decoder");
                    decoder.feed(&raw, &mut decoded)?;
                    if !decoded.is_empty() {
                        self.produced += decoded.len() as u64;
                        self.out.write(&decoded);
                    }
                    if decoder.is_done() {
                        self.done = true;
                    }
                }
            }
        }
        Ok(self.produced - before)
    }

    /// The underlying channel hit EOS. Close-delimited bodies simply end;
    /// anything else short of its framing is a truncation.
    pub fn on_eos(&mut self) {
        if self.done {
            return;
        }
        match self.framing {
            BodyFraming::CloseDelimited => self.done = true,
            _ => {
                self.truncated = true;
                self.done = true;
            }
        }
    }
}

/// Moves decoded (and possibly transformed) body bytes toward the client
/// and keeps the transform-chain input VIO fed and finalized.
pub struct Tunnel {
    pub source: BodySource,
    /// Write VIO into the first transform, when a chain is installed.
    pub chain_input_vio: Option<VioId>,
    chain_finalized: bool,
    /// Post-chain body bytes (the collector's read buffer, or the source's
    /// own output when no chain exists).
    pub body_out_reader: IoReader,
    /// True once the post-chain body is complete (collector EOS, or source
    /// completion when no chain exists).
    pub collector_done: bool,
    pub client_buf: IoBuffer,
    pub client_vio: VioId,
    pub header_len: u64,
    pub body_to_client: u64,
    client_finalized: bool,
}

impl Tunnel {
    pub fn new(
        source: BodySource,
        chain_input_vio: Option<VioId>,
        body_out_reader: IoReader,
        client_buf: IoBuffer,
        client_vio: VioId,
        header_len: u64,
    ) -> Self {
        Self {
            source,
            chain_input_vio,
            chain_finalized: false,
            body_out_reader,
            collector_done: false,
            client_buf,
            client_vio,
            header_len,
            body_to_client: 0,
            client_finalized: false,
        }
    }

    pub fn has_chain(&self) -> bool {
        self.chain_input_vio.is_some()
    }

    pub fn body_done(&self) -> bool {
        if self.has_chain() { self.collector_done } else { self.source.done }
    }

    /// One service sweep: pump the source, feed/finalize the chain, move
    /// post-chain bytes to the client, finalize the client write when the
    /// body is fully staged. Returns true once the client VIO is finalized.
    pub fn service(&mut self, rx: &mut Reactor) -> Result<bool, ProxyError> {
        let fresh = self.source.pump()?;
        if let Some(chain_vio) = self.chain_input_vio {
            if fresh > 0 {
                rx.reenable(chain_vio);
            }
            if self.source.done && !self.chain_finalized {
                self.chain_finalized = true;
                rx.set_vio_nbytes(chain_vio, self.source.produced);
                rx.reenable(chain_vio);
            }
        }

        let avail = self.body_out_reader.read_avail();
        if avail > 0 {
            for seg in self.body_out_reader.take_bytes(avail) {
                self.client_buf.append_bytes(seg);
            }
            self.body_to_client += avail as u64;
            rx.reenable(self.client_vio);
        }

        if self.body_done() && self.body_out_reader.read_avail() == 0 && !self.client_finalized {
            self.client_finalized = true;
            rx.set_vio_nbytes(self.client_vio, self.header_len + self.body_to_client);
            rx.reenable(self.client_vio);
        }
        Ok(self.client_finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_io::buffer::BUFFER_SIZE_INDEX_4K;

    fn raw_pair() -> (IoBuffer, IoReader) {
        let buf = IoBuffer::new(BUFFER_SIZE_INDEX_4K);
        let reader = buf.alloc_reader();
        (buf, reader)
    }

    #[test]
    fn content_length_source_completes_exactly() {
        let (raw, reader) = raw_pair();
        let mut src = BodySource::new(BodyFraming::ContentLength(10), reader);
        let out_reader = src.out.alloc_reader();
        raw.write(b"0123456");
        assert_eq!(src.pump().unwrap(), 7);
        assert!(!src.done);
        raw.write(b"789-extra-pipelined");
        assert_eq!(src.pump().unwrap(), 3);
        assert!(src.done);
        assert_eq!(out_reader.read_all(), b"0123456789");
    }

    #[test]
    fn close_delimited_source_ends_on_eos() {
        let (raw, reader) = raw_pair();
        let mut src = BodySource::new(BodyFraming::CloseDelimited, reader);
        raw.write(b"stream");
        src.pump().unwrap();
        assert!(!src.done);
        src.on_eos();
        assert!(src.done);
        assert!(!src.truncated);
    }

    #[test]
    fn early_eos_on_content_length_is_truncation() {
        let (raw, reader) = raw_pair();
        let mut src = BodySource::new(BodyFraming::ContentLength(100), reader);
        raw.write(b"short");
        src.pump().unwrap();
        src.on_eos();
        assert!(src.done);
        assert!(src.truncated);
        assert_eq!(src.produced, 5);
    }

    #[test]
    fn chunked_source_decodes_and_finishes() {
        let (raw, reader) = raw_pair();
        let mut src = BodySource::new(BodyFraming::Chunked, reader);
        let out_reader = src.out.alloc_reader();
        raw.write(b"3\r\nabc\r\n");
        src.pump().unwrap();
        assert_eq!(out_reader.read_all(), b"abc");
        assert!(!src.done);
        raw.write(b"0\r\n\r\n");
        src.pump().unwrap();
        assert!(src.done);
        assert!(!src.truncated);
    }

    #[test]
    fn no_body_framing_is_done_immediately() {
        let (_raw, reader) = raw_pair();
        let src = BodySource::new(BodyFraming::None, reader);
        assert!(src.done);
        assert_eq!(src.expected(), Some(0));
    }
}
