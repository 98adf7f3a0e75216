use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::BufferError;

/// Where a buffer's storage came from; decides how deallocation hands the
/// memory back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryKind {
    Direct,
    Heap,
}

/// Receives a buffer's storage when its reference count hits zero.
pub(crate) trait Reclaim: Send + Sync {
    fn reclaim(&self, kind: MemoryKind, data: Vec<u8>);
}

/// Shared header behind every handle to the same buffer.
///
/// The header stays alive as long as any handle exists; `deallocate` only
/// empties the storage, so a stale handle observes `Released` instead of a
/// dangling pointer.
pub(crate) struct Shared {
    refcnt: AtomicI32,
    capacity: usize,
    kind: MemoryKind,
    reclaim: Option<Arc<dyn Reclaim>>,
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: the reference count is atomic, and the byte storage is governed by
// the buffer contract: cursor and data operations require exclusive logical
// ownership of the handle, and deallocation happens on exactly one thread
// (the one whose release drove the count to zero).
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn deallocate(&self) {
        // SAFETY: called only by the release that moved the count to zero,
        // which happens once; no live handle may touch the bytes afterwards.
        let data = unsafe { std::mem::take(&mut *self.data.get()) };
        if let Some(reclaim) = &self.reclaim {
            reclaim.reclaim(self.kind, data);
        }
    }
}

/// A reference-counted byte region with independent read and write cursors.
///
/// Invariant: `reader_index <= writer_index <= capacity`.
///
/// The count is shared between handles produced by [`ByteBuf::retained`];
/// the cursors are per handle. Cursor and data operations require the caller
/// to be the buffer's sole logical owner at that moment - the same contract
/// the reactor's single-threaded dispatch provides for every message flowing
/// through a pipeline.
pub struct ByteBuf {
    shared: Arc<Shared>,
    reader_index: usize,
    writer_index: usize,
}

impl ByteBuf {
    pub(crate) fn new(
        data: Vec<u8>,
        kind: MemoryKind,
        reclaim: Option<Arc<dyn Reclaim>>,
    ) -> ByteBuf {
        let capacity = data.len();
        ByteBuf {
            shared: Arc::new(Shared {
                refcnt: AtomicI32::new(1),
                capacity,
                kind,
                reclaim,
                data: UnsafeCell::new(data),
            }),
            reader_index: 0,
            writer_index: 0,
        }
    }

    /// A zero-capacity buffer. Useful as the result of draining operations;
    /// releasing it is a no-op on memory.
    pub fn empty() -> ByteBuf {
        ByteBuf::new(Vec::new(), MemoryKind::Heap, None)
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Current read cursor.
    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    /// Current write cursor.
    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Bytes available to read: `writer_index - reader_index`.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Bytes available to write: `capacity - writer_index`.
    pub fn writable_bytes(&self) -> usize {
        self.shared.capacity - self.writer_index
    }

    /// `true` if at least one byte can be read.
    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// `true` if the storage is tagged as direct (off the general-purpose
    /// heap path). Purely informational; the buffer contract is identical.
    pub fn is_direct(&self) -> bool {
        self.shared.kind == MemoryKind::Direct
    }

    /// Current reference count. Zero means the storage is gone.
    pub fn refcnt(&self) -> i32 {
        self.shared.refcnt.load(Ordering::Acquire)
    }

    /// Moves the read cursor.
    ///
    /// # Panics
    ///
    /// Panics if `index > writer_index`.
    pub fn set_reader_index(&mut self, index: usize) {
        assert!(
            index <= self.writer_index,
            "reader_index {} > writer_index {}",
            index,
            self.writer_index
        );
        self.reader_index = index;
    }

    /// Moves the write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `index < reader_index` or `index > capacity`.
    pub fn set_writer_index(&mut self, index: usize) {
        assert!(
            index >= self.reader_index && index <= self.shared.capacity,
            "writer_index {} outside [{}, {}]",
            index,
            self.reader_index,
            self.shared.capacity
        );
        self.writer_index = index;
    }

    /// Resets both cursors to zero without touching the bytes.
    pub fn clear(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    /// The readable slice, `[reader_index, writer_index)`.
    pub fn readable(&self) -> Result<&[u8], BufferError> {
        let data = self.storage()?;
        Ok(&data[self.reader_index..self.writer_index])
    }

    /// Appends `src` at the write cursor and advances it.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), BufferError> {
        if src.len() > self.writable_bytes() {
            return Err(BufferError::TooLarge {
                requested: src.len(),
                limit: self.writable_bytes(),
            });
        }
        let start = self.writer_index;
        let data = self.storage_mut()?;
        data[start..start + src.len()].copy_from_slice(src);
        self.writer_index += src.len();
        Ok(())
    }

    /// Copies `dst.len()` bytes from the read cursor into `dst` and advances
    /// the cursor.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        if dst.len() > self.readable_bytes() {
            return Err(BufferError::TooLarge {
                requested: dst.len(),
                limit: self.readable_bytes(),
            });
        }
        let start = self.reader_index;
        let data = self.storage()?;
        dst.copy_from_slice(&data[start..start + dst.len()]);
        self.reader_index += dst.len();
        Ok(())
    }

    /// Advances the read cursor by `n` without copying.
    ///
    /// # Panics
    ///
    /// Panics if `n > readable_bytes()`.
    pub fn skip_bytes(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "skip {} > readable", n);
        self.reader_index += n;
    }

    /// The writable region as a mutable slice. After filling some prefix,
    /// commit it with [`ByteBuf::advance_writer`].
    pub fn writable_mut(&mut self) -> Result<&mut [u8], BufferError> {
        let start = self.writer_index;
        let cap = self.shared.capacity;
        let data = self.storage_mut()?;
        Ok(&mut data[start..cap])
    }

    /// Commits `n` bytes previously written through
    /// [`ByteBuf::writable_mut`].
    ///
    /// # Panics
    ///
    /// Panics if `n > writable_bytes()`.
    pub fn advance_writer(&mut self, n: usize) {
        assert!(n <= self.writable_bytes(), "advance {} > writable", n);
        self.writer_index += n;
    }

    /// Increments the reference count by one.
    pub fn retain(&self) -> Result<(), BufferError> {
        self.retain_n(1)
    }

    /// Increments the reference count by `increment`.
    ///
    /// Fails with [`BufferError::IllegalRefCount`] - after undoing the
    /// adjustment - if the buffer was already dead or the count would
    /// overflow.
    ///
    /// # Panics
    ///
    /// Panics if `increment == 0`.
    pub fn retain_n(&self, increment: u32) -> Result<(), BufferError> {
        assert!(increment > 0, "increment must be positive");
        let inc = i32::try_from(increment).map_err(|_| BufferError::TooLarge {
            requested: increment as usize,
            limit: i32::MAX as usize,
        })?;
        let old = self.shared.refcnt.fetch_add(inc, Ordering::AcqRel);
        if old <= 0 || old.checked_add(inc).is_none() {
            // Undo: never resurrect, never overflow.
            self.shared.refcnt.fetch_sub(inc, Ordering::AcqRel);
            return Err(BufferError::IllegalRefCount {
                count: old,
                delta: inc,
            });
        }
        Ok(())
    }

    /// Decrements the reference count by one. Returns `true` if this call
    /// deallocated the buffer.
    pub fn release(&self) -> Result<bool, BufferError> {
        self.release_n(1)
    }

    /// Decrements the reference count by `decrement`, deallocating exactly
    /// once when it reaches zero.
    ///
    /// Fails with [`BufferError::IllegalRefCount`] - after undoing the
    /// adjustment - if the count would go negative.
    ///
    /// # Panics
    ///
    /// Panics if `decrement == 0`.
    pub fn release_n(&self, decrement: u32) -> Result<bool, BufferError> {
        assert!(decrement > 0, "decrement must be positive");
        let dec = i32::try_from(decrement).map_err(|_| BufferError::TooLarge {
            requested: decrement as usize,
            limit: i32::MAX as usize,
        })?;
        let old = self.shared.refcnt.fetch_sub(dec, Ordering::AcqRel);
        if old == dec {
            self.shared.deallocate();
            Ok(true)
        } else if old < dec {
            self.shared.refcnt.fetch_add(dec, Ordering::AcqRel);
            Err(BufferError::IllegalRefCount {
                count: old,
                delta: -dec,
            })
        } else {
            Ok(false)
        }
    }

    /// Leak-diagnostic breadcrumb. A no-op unless a leak detector is wired
    /// in, which this crate does not ship.
    pub fn touch(&self, _hint: &str) -> &Self {
        self
    }

    /// Retains the buffer and returns a second handle sharing the storage
    /// and count, with independent cursors positioned like this handle's.
    pub fn retained(&self) -> Result<ByteBuf, BufferError> {
        self.retain()?;
        Ok(ByteBuf {
            shared: Arc::clone(&self.shared),
            reader_index: self.reader_index,
            writer_index: self.writer_index,
        })
    }

    fn storage(&self) -> Result<&[u8], BufferError> {
        if self.refcnt() <= 0 {
            return Err(BufferError::Released);
        }
        // SAFETY: count observed above zero and the handle contract gives the
        // caller exclusive logical ownership for the duration of the borrow.
        Ok(unsafe { (*self.shared.data.get()).as_slice() })
    }

    fn storage_mut(&mut self) -> Result<&mut [u8], BufferError> {
        if self.refcnt() <= 0 {
            return Err(BufferError::Released);
        }
        // SAFETY: as above, plus `&mut self` rules out aliased mutation
        // through this handle.
        Ok(unsafe { (*self.shared.data.get()).as_mut_slice() })
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("ridx", &self.reader_index)
            .field("widx", &self.writer_index)
            .field("cap", &self.shared.capacity)
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(cap: usize) -> ByteBuf {
        ByteBuf::new(vec![0; cap], MemoryKind::Heap, None)
    }

    #[test]
    fn cursors_start_at_zero() {
        let b = buf(16);
        assert_eq!(b.capacity(), 16);
        assert_eq!(b.reader_index(), 0);
        assert_eq!(b.writer_index(), 0);
        assert_eq!(b.refcnt(), 1);
        assert!(!b.is_readable());
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut b = buf(16);
        b.write_bytes(b"hello").unwrap();
        assert_eq!(b.readable_bytes(), 5);
        let mut out = [0u8; 5];
        b.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(b.readable_bytes(), 0);
    }

    #[test]
    fn write_overflow_is_too_large() {
        let mut b = buf(4);
        assert!(matches!(
            b.write_bytes(b"hello"),
            Err(BufferError::TooLarge { .. })
        ));
        // Nothing was written.
        assert_eq!(b.writer_index(), 0);
    }

    #[test]
    fn retain_release_cancel_out() {
        let b = buf(8);
        b.retain_n(3).unwrap();
        assert_eq!(b.refcnt(), 4);
        assert!(!b.release_n(3).unwrap());
        assert_eq!(b.refcnt(), 1);
    }

    #[test]
    fn double_release_fails_without_double_free() {
        let b = buf(8);
        assert!(b.release().unwrap());
        assert_eq!(b.refcnt(), 0);
        assert_eq!(
            b.release(),
            Err(BufferError::IllegalRefCount {
                count: 0,
                delta: -1
            })
        );
        assert_eq!(b.refcnt(), 0);
    }

    #[test]
    fn retain_after_release_fails() {
        let b = buf(8);
        b.release().unwrap();
        assert!(matches!(
            b.retain(),
            Err(BufferError::IllegalRefCount { count: 0, delta: 1 })
        ));
    }

    #[test]
    fn access_after_release_is_released() {
        let mut b = buf(8);
        b.write_bytes(b"x").unwrap();
        b.release().unwrap();
        assert_eq!(b.readable().unwrap_err(), BufferError::Released);
        assert_eq!(b.write_bytes(b"y").unwrap_err(), BufferError::Released);
    }

    #[test]
    fn retained_handle_shares_count() {
        let b = buf(8);
        let c = b.retained().unwrap();
        assert_eq!(b.refcnt(), 2);
        assert!(!c.release().unwrap());
        assert!(b.release().unwrap());
    }
}
