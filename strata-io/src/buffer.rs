use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Block sizes are `128 << index`, drawn lazily from the shared `BytesMut`
/// pool. Index 5 = 4 KiB, 6 = 8 KiB, 8 = 32 KiB.
pub const BUFFER_SIZE_INDEX_4K: usize = 5;
pub const BUFFER_SIZE_INDEX_8K: usize = 6;
pub const BUFFER_SIZE_INDEX_32K: usize = 8;

pub fn index_to_block_size(index: usize) -> usize {
    128usize << index
}

#[derive(Debug)]
struct Inner {
    /// Frozen readable segments, oldest first.
    chain: VecDeque<Bytes>,
    /// Write head. Frozen into `chain` when it reaches `block_size`.
    tail: BytesMut,
    /// Absolute stream offset of the first retained byte.
    head_off: u64,
    /// Absolute stream offset one past the last produced byte.
    write_off: u64,
    water_mark: usize,
    block_size: usize,
    /// Reader cursors by slot; `None` marks a free slot.
    readers: Vec<Option<u64>>,
}

impl Inner {
    fn freeze_tail(&mut self) {
        if !self.tail.is_empty() {
            let frozen = self.tail.split().freeze();
            self.chain.push_back(frozen);
        }
    }

    fn min_cursor(&self) -> Option<u64> {
        self.readers.iter().flatten().min().copied()
    }

    /// Release chain blocks that every reader has advanced past.
    fn reclaim(&mut self) {
        let Some(min) = self.min_cursor() else { return };
        while let Some(front) = self.chain.front() {
            let end = self.head_off + front.len() as u64;
            if end <= min {
                self.head_off = end;
                self.chain.pop_front();
            } else {
                break;
            }
        }
    }

    /// Walk readable segments starting at absolute offset `from`, up to `n`
    /// bytes, calling `f` per contiguous slice.
    fn for_each_segment(&self, from: u64, mut n: usize, mut f: impl FnMut(&[u8])) {
        debug_assert!(from >= self.head_off && from <= self.write_off);
        let mut seg_start = self.head_off;
        for seg in &self.chain {
            let seg_end = seg_start + seg.len() as u64;
            if n > 0 && from < seg_end {
                let lo = from.max(seg_start) - seg_start;
                let take = ((seg.len() as u64 - lo) as usize).min(n);
                f(&seg[lo as usize..lo as usize + take]);
                n -= take;
            }
            seg_start = seg_end;
        }
        if n > 0 && !self.tail.is_empty() {
            let lo = from.max(seg_start) - seg_start;
            let avail = self.tail.len() - lo as usize;
            let take = avail.min(n);
            f(&self.tail[lo as usize..lo as usize + take]);
        }
    }

    /// Zero-copy slices of the range `[from, from + n)`. The portion still
    /// sitting in the write head is copied (it cannot be shared un-frozen).
    fn slice_segments(&self, from: u64, n: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut remaining = n;
        let mut seg_start = self.head_off;
        for seg in &self.chain {
            let seg_end = seg_start + seg.len() as u64;
            if remaining > 0 && from < seg_end {
                let lo = from.max(seg_start) - seg_start;
                let take = ((seg.len() as u64 - lo) as usize).min(remaining);
                out.push(seg.slice(lo as usize..lo as usize + take));
                remaining -= take;
            }
            seg_start = seg_end;
        }
        if remaining > 0 && !self.tail.is_empty() {
            let lo = (from.max(seg_start) - seg_start) as usize;
            let take = (self.tail.len() - lo).min(remaining);
            out.push(Bytes::copy_from_slice(&self.tail[lo..lo + take]));
        }
        out
    }
}

/// Reference-counted append-only block chain with independent reader
/// cursors. Cloning the handle shares the underlying buffer.
#[derive(Clone, Debug)]
pub struct IoBuffer {
    inner: Rc<RefCell<Inner>>,
}

struct SlotGuard {
    inner: Weak<RefCell<Inner>>,
    slot: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut b = inner.borrow_mut();
            b.readers[self.slot] = None;
            b.reclaim();
        }
    }
}

/// An advancing cursor over an [`IoBuffer`]. `Clone` shares the cursor;
/// [`IoReader::fork`] creates an independent one at the same position.
pub struct IoReader {
    inner: Rc<RefCell<Inner>>,
    guard: Rc<SlotGuard>,
}

impl IoBuffer {
    pub fn new(size_index: usize) -> Self {
        Self::with_water_mark(size_index, 0)
    }

    pub fn with_water_mark(size_index: usize, water_mark: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                chain: VecDeque::new(),
                tail: BytesMut::new(),
                head_off: 0,
                write_off: 0,
                water_mark,
                block_size: index_to_block_size(size_index),
                readers: Vec::new(),
            })),
        }
    }

    pub fn water_mark(&self) -> usize {
        self.inner.borrow().water_mark
    }

    pub fn set_water_mark(&self, n: usize) {
        self.inner.borrow_mut().water_mark = n;
    }

    /// Copy `data` in and advance the write head.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut b = self.inner.borrow_mut();
        let mut off = 0;
        while off < data.len() {
            let room = b.block_size - b.tail.len();
            let take = room.min(data.len() - off);
            b.tail.extend_from_slice(&data[off..off + take]);
            off += take;
            if b.tail.len() >= b.block_size {
                b.freeze_tail();
            }
        }
        b.write_off += data.len() as u64;
        data.len()
    }

    /// Splice a frozen segment in without copying.
    pub fn append_bytes(&self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut b = self.inner.borrow_mut();
        b.freeze_tail();
        b.write_off += bytes.len() as u64;
        b.chain.push_back(bytes);
    }

    pub fn alloc_reader(&self) -> IoReader {
        let slot = {
            let mut b = self.inner.borrow_mut();
            let cursor = b.head_off;
            match b.readers.iter().position(|r| r.is_none()) {
                Some(i) => {
                    b.readers[i] = Some(cursor);
                    i
                }
                None => {
                    b.readers.push(Some(cursor));
                    b.readers.len() - 1
                }
            }
        };
        IoReader {
            inner: Rc::clone(&self.inner),
            guard: Rc::new(SlotGuard { inner: Rc::downgrade(&self.inner), slot }),
        }
    }

    /// Largest `read_avail` over all readers (total retained bytes when no
    /// reader exists). This is what the water-mark is tested against.
    pub fn max_read_avail(&self) -> usize {
        let b = self.inner.borrow();
        let base = b.min_cursor().unwrap_or(b.head_off);
        (b.write_off - base) as usize
    }

    pub fn water_mark_reached(&self) -> bool {
        self.max_read_avail() >= self.inner.borrow().water_mark
    }

    /// Retained block count, including the write head.
    pub fn block_count(&self) -> usize {
        let b = self.inner.borrow();
        b.chain.len() + usize::from(!b.tail.is_empty())
    }
}

impl IoReader {
    fn cursor(&self) -> u64 {
        self.inner.borrow().readers[self.guard.slot].unwrap_or(0)
    }

    pub fn read_avail(&self) -> usize {
        let b = self.inner.borrow();
        (b.write_off - b.readers[self.guard.slot].unwrap_or(b.write_off)) as usize
    }

    pub fn is_read_avail_more_than(&self, n: usize) -> bool {
        self.read_avail() > n
    }

    /// Advance the cursor. Panics if `n` exceeds `read_avail`.
    pub fn consume(&self, n: usize) {
        let mut b = self.inner.borrow_mut();
        let cursor = b.readers[self.guard.slot].unwrap_or(0);
        assert!(
            cursor + n as u64 <= b.write_off,
            "consume({n}) past write head (avail {})",
            b.write_off - cursor
        );
        b.readers[self.guard.slot] = Some(cursor + n as u64);
        b.reclaim();
    }

    /// Copy up to `out.len()` bytes from the cursor without consuming.
    pub fn copy_out(&self, out: &mut [u8]) -> usize {
        let b = self.inner.borrow();
        let cursor = b.readers[self.guard.slot].unwrap_or(0);
        let n = out.len().min((b.write_off - cursor) as usize);
        let mut off = 0;
        b.for_each_segment(cursor, n, |seg| {
            out[off..off + seg.len()].copy_from_slice(seg);
            off += seg.len();
        });
        n
    }

    /// Copy-and-consume.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.copy_out(out);
        self.consume(n);
        n
    }

    /// Consume everything available into a `Vec`.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.read_avail()];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }

    /// Zero-copy consume of up to `n` bytes.
    pub fn take_bytes(&self, n: usize) -> Vec<Bytes> {
        let take = n.min(self.read_avail());
        let segs = self.inner.borrow().slice_segments(self.cursor(), take);
        self.consume(take);
        segs
    }

    /// Independent reader at the same position.
    pub fn fork(&self) -> IoReader {
        let slot = {
            let mut b = self.inner.borrow_mut();
            let cursor = b.readers[self.guard.slot];
            match b.readers.iter().position(|r| r.is_none()) {
                Some(i) => {
                    b.readers[i] = cursor;
                    i
                }
                None => {
                    b.readers.push(cursor);
                    b.readers.len() - 1
                }
            }
        };
        IoReader {
            inner: Rc::clone(&self.inner),
            guard: Rc::new(SlotGuard { inner: Rc::downgrade(&self.inner), slot }),
        }
    }
}

impl Clone for IoReader {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner), guard: Rc::clone(&self.guard) }
    }
}

/// Splice up to `n` bytes from `src` (skipping `skip`) into `dst` without
/// consuming the source. Returns the number of bytes transferred.
pub fn copy(dst: &IoBuffer, src: &IoReader, n: usize, skip: usize) -> usize {
    let avail = src.read_avail();
    if skip >= avail {
        return 0;
    }
    let take = n.min(avail - skip);
    let segs = src
        .inner
        .borrow()
        .slice_segments(src.cursor() + skip as u64, take);
    for seg in segs {
        dst.append_bytes(seg);
    }
    take
}
