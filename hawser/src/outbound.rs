use std::collections::VecDeque;

use hawser_buffer::ByteBuf;
use hawser_executor::Promise;
use log::warn;

/// One pending write: the bytes, their original size for watermark
/// accounting, and the promise completed when the kernel accepts them.
struct Entry {
    buf: ByteBuf,
    size: usize,
    promise: Promise<()>,
}

/// How a mutation moved the pending-byte count relative to the watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Writability {
    /// No watermark was crossed.
    Unchanged,
    /// Pending bytes rose through the high watermark.
    BecameUnwritable,
    /// Pending bytes fell through the low watermark.
    BecameWritable,
}

/// The outbound queue of a channel: entries accumulate via `add_message`,
/// a `add_flush` marks the prefix eligible for the socket, and the drain
/// completes promises strictly in insertion order.
///
/// Mutated only by the owning reactor.
pub(crate) struct OutboundBuffer {
    entries: VecDeque<Entry>,
    /// How many entries from the front are flushable.
    flushed: usize,
    pending_bytes: usize,
    writable: bool,
}

impl OutboundBuffer {
    pub(crate) fn new() -> OutboundBuffer {
        OutboundBuffer {
            entries: VecDeque::new(),
            flushed: 0,
            pending_bytes: 0,
            writable: true,
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// `true` when no flushable entry remains.
    pub(crate) fn is_drained(&self) -> bool {
        self.flushed == 0
    }

    pub(crate) fn add_message(
        &mut self,
        buf: ByteBuf,
        size: usize,
        promise: Promise<()>,
        high_water_mark: usize,
    ) -> Writability {
        self.entries.push_back(Entry { buf, size, promise });
        self.pending_bytes += size;
        if self.writable && self.pending_bytes > high_water_mark {
            self.writable = false;
            return Writability::BecameUnwritable;
        }
        Writability::Unchanged
    }

    /// Marks everything queued so far as flushable.
    pub(crate) fn add_flush(&mut self) {
        self.flushed = self.entries.len();
    }

    /// The buffer at the head of the flushable prefix.
    pub(crate) fn current(&mut self) -> Option<&mut ByteBuf> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front_mut().map(|entry| &mut entry.buf)
    }

    /// Removes the head entry after it was fully written, releasing its
    /// buffer. The promise is handed back instead of completed: the caller
    /// completes it after dropping the channel's I/O lock, because promise
    /// listeners may re-enter channel operations.
    pub(crate) fn remove_written(&mut self, low_water_mark: usize) -> (Option<Promise<()>>, Writability) {
        let Some(entry) = self.entries.pop_front() else {
            return (None, Writability::Unchanged);
        };
        self.flushed -= 1;
        self.pending_bytes -= entry.size;
        if let Err(err) = entry.buf.release() {
            warn!("outbound buffer release failed: {}", err);
        }
        let change = self.recheck_writable(low_water_mark);
        (Some(entry.promise), change)
    }

    /// Drains only the flushable prefix, releasing its buffers; used when a
    /// flush arrives on a channel that cannot write. Promises come back for
    /// the caller to fail outside the I/O lock.
    pub(crate) fn drain_flushed(&mut self) -> Vec<Promise<()>> {
        let mut promises = Vec::with_capacity(self.flushed);
        while self.flushed > 0 {
            let Some(entry) = self.entries.pop_front() else { break };
            self.flushed -= 1;
            self.pending_bytes -= entry.size;
            if let Err(err) = entry.buf.release() {
                warn!("outbound buffer release failed: {}", err);
            }
            promises.push(entry.promise);
        }
        promises
    }

    /// Drains every entry, flushed or not, releasing the buffers. The
    /// promises come back for the caller to fail outside the I/O lock.
    pub(crate) fn drain_all(&mut self) -> Vec<Promise<()>> {
        let mut promises = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            self.pending_bytes -= entry.size;
            if let Err(err) = entry.buf.release() {
                warn!("outbound buffer release failed: {}", err);
            }
            promises.push(entry.promise);
        }
        self.flushed = 0;
        promises
    }

    /// `true` while at least one flushable entry remains.
    pub(crate) fn has_flushable(&self) -> bool {
        self.flushed > 0
    }

    fn recheck_writable(&mut self, low_water_mark: usize) -> Writability {
        if !self.writable && self.pending_bytes < low_water_mark {
            self.writable = true;
            return Writability::BecameWritable;
        }
        Writability::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_buffer::{BufferAllocator, UnpooledAllocator};
    use hawser_executor::{Cause, ImmediateExecutor, Promise};

    const HIGH: usize = 64 * 1024;
    const LOW: usize = 32 * 1024;

    fn entry(bytes: usize) -> (ByteBuf, usize, Promise<()>) {
        let mut buf = UnpooledAllocator.heap_buffer(bytes).unwrap();
        buf.set_writer_index(bytes);
        (buf, bytes, Promise::new(ImmediateExecutor::new()))
    }

    #[test]
    fn watermark_crossings_fire_once_each_way() {
        let mut out = OutboundBuffer::new();
        // 70 KiB of pending writes against a 64 KiB high watermark.
        let (buf, size, promise) = entry(35 * 1024);
        assert_eq!(out.add_message(buf, size, promise, HIGH), Writability::Unchanged);
        let (buf, size, promise) = entry(35 * 1024);
        assert_eq!(
            out.add_message(buf, size, promise, HIGH),
            Writability::BecameUnwritable
        );
        assert!(!out.is_writable());

        out.add_flush();
        // Draining the first 35 KiB leaves 35 KiB pending: still above low.
        assert_eq!(out.remove_written(LOW).1, Writability::Unchanged);
        // Draining the rest crosses the low watermark exactly once.
        assert_eq!(out.remove_written(LOW).1, Writability::BecameWritable);
        assert!(out.is_writable());
    }

    #[test]
    fn promises_complete_in_insertion_order() {
        let mut out = OutboundBuffer::new();
        let mut futures = Vec::new();
        for _ in 0..3 {
            let (buf, size, promise) = entry(16);
            futures.push(promise.future());
            out.add_message(buf, size, promise, HIGH);
        }
        out.add_flush();
        let (promise, _) = out.remove_written(LOW);
        promise.unwrap().try_success(());
        assert!(futures[0].is_success());
        assert!(!futures[1].is_done());
        let (promise, _) = out.remove_written(LOW);
        promise.unwrap().try_success(());
        assert!(futures[1].is_success());
        assert!(!futures[2].is_done());
    }

    #[test]
    fn unflushed_entries_fail_on_close_too() {
        let mut out = OutboundBuffer::new();
        let (buf, size, promise) = entry(16);
        let flushed = promise.future();
        out.add_message(buf, size, promise, HIGH);
        out.add_flush();
        let (buf, size, promise) = entry(16);
        let unflushed = promise.future();
        out.add_message(buf, size, promise, HIGH);

        let cause: Cause = std::sync::Arc::new(crate::error::TransportError::ClosedChannel);
        for promise in out.drain_all() {
            promise.try_failure(cause.clone());
        }
        assert!(flushed.is_done() && !flushed.is_success());
        assert!(unflushed.is_done() && !unflushed.is_success());
        assert_eq!(out.pending_bytes(), 0);
        assert!(out.is_drained());
    }
}
