use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::byte_buf::{ByteBuf, MemoryKind, Reclaim};
use crate::error::BufferError;

/// Largest single allocation any shipped allocator will serve.
const MAX_ALLOC: usize = 1 << 30;

/// Allocation policy for channel buffers.
///
/// Implementations decide where the bytes live (pooled or not, direct or
/// heap); the buffers they hand out all obey the same [`ByteBuf`] contract.
pub trait BufferAllocator: Send + Sync + 'static {
    /// Allocates a buffer tagged as direct memory.
    fn direct_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError>;

    /// Allocates a buffer tagged as heap memory.
    fn heap_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError>;

    /// Allocates a buffer suitable for socket I/O: direct when the allocator
    /// can serve direct buffers cheaply, heap otherwise.
    fn io_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError>;

    /// `true` if direct buffers come from a pool.
    fn is_direct_buffer_pooled(&self) -> bool;
}

fn check_capacity(capacity: usize) -> Result<(), BufferError> {
    if capacity > MAX_ALLOC {
        return Err(BufferError::TooLarge {
            requested: capacity,
            limit: MAX_ALLOC,
        });
    }
    Ok(())
}

/// Allocator without any pooling: every buffer is a fresh allocation and
/// deallocation frees it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpooledAllocator;

impl BufferAllocator for UnpooledAllocator {
    fn direct_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        check_capacity(capacity)?;
        Ok(ByteBuf::new(vec![0; capacity], MemoryKind::Direct, None))
    }

    fn heap_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        check_capacity(capacity)?;
        Ok(ByteBuf::new(vec![0; capacity], MemoryKind::Heap, None))
    }

    fn io_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        self.direct_buffer(capacity)
    }

    fn is_direct_buffer_pooled(&self) -> bool {
        false
    }
}

/// Smallest pooled size class.
const MIN_CLASS_SHIFT: u32 = 10; // 1 KiB
/// Largest pooled size class.
const MAX_CLASS_SHIFT: u32 = 22; // 4 MiB
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
/// Free-list depth per size class.
const MAX_FREE_PER_CLASS: usize = 64;

struct PoolInner {
    direct: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
    heap: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

impl PoolInner {
    fn lists(&self, kind: MemoryKind) -> &[Mutex<Vec<Vec<u8>>>; CLASS_COUNT] {
        match kind {
            MemoryKind::Direct => &self.direct,
            MemoryKind::Heap => &self.heap,
        }
    }

    fn class_index(size: usize) -> Option<usize> {
        let shift = size.next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
        if shift > MAX_CLASS_SHIFT {
            return None;
        }
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }

    fn acquire(&self, kind: MemoryKind, capacity: usize) -> Option<Vec<u8>> {
        let idx = Self::class_index(capacity)?;
        let class_size = 1usize << (idx as u32 + MIN_CLASS_SHIFT);
        let mut free = self.lists(kind)[idx].lock();
        Some(match free.pop() {
            Some(data) => data,
            None => vec![0; class_size],
        })
    }
}

impl Reclaim for PoolInner {
    fn reclaim(&self, kind: MemoryKind, data: Vec<u8>) {
        match Self::class_index(data.len()) {
            Some(idx) if data.len().is_power_of_two() && data.len() >= (1 << MIN_CLASS_SHIFT) => {
                let mut free = self.lists(kind)[idx].lock();
                if free.len() < MAX_FREE_PER_CLASS {
                    free.push(data);
                    return;
                }
                trace!("size class {} full, dropping {} bytes", idx, data.len());
            }
            _ => {}
        }
    }
}

/// Allocator with power-of-two size-class pooling for both direct and heap
/// buffers.
///
/// Requests above the largest class fall through to plain allocations that
/// are freed, not pooled. The pool never shrinks a class below the bytes
/// currently lent out; free lists are bounded so a burst does not pin memory
/// forever.
#[derive(Clone)]
pub struct PooledAllocator {
    inner: Arc<PoolInner>,
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocator {
    /// Creates an allocator with empty free lists.
    pub fn new() -> PooledAllocator {
        PooledAllocator {
            inner: Arc::new(PoolInner {
                direct: Default::default(),
                heap: Default::default(),
            }),
        }
    }

    fn buffer(&self, kind: MemoryKind, capacity: usize) -> Result<ByteBuf, BufferError> {
        check_capacity(capacity)?;
        match self.inner.acquire(kind, capacity) {
            Some(data) => Ok(ByteBuf::new(
                data,
                kind,
                Some(Arc::clone(&self.inner) as Arc<dyn Reclaim>),
            )),
            // Above the largest class: unpooled allocation.
            None => Ok(ByteBuf::new(vec![0; capacity], kind, None)),
        }
    }

    #[cfg(test)]
    fn free_count(&self, kind: MemoryKind, capacity: usize) -> usize {
        let idx = PoolInner::class_index(capacity).unwrap();
        self.inner.lists(kind)[idx].lock().len()
    }
}

impl BufferAllocator for PooledAllocator {
    fn direct_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        self.buffer(MemoryKind::Direct, capacity)
    }

    fn heap_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        self.buffer(MemoryKind::Heap, capacity)
    }

    fn io_buffer(&self, capacity: usize) -> Result<ByteBuf, BufferError> {
        self.direct_buffer(capacity)
    }

    fn is_direct_buffer_pooled(&self) -> bool {
        true
    }
}

/// Converts `src` into a direct buffer when that is cheap, releasing `src`.
///
/// Policy:
/// - an empty source is released and replaced with [`ByteBuf::empty`];
/// - a pooled-direct allocator copies the readable slice into a fresh direct
///   buffer and releases the source;
/// - otherwise the source is returned unchanged - allocating and freeing an
///   unpooled direct buffer per message costs more than it saves.
pub fn new_direct_buffer(
    alloc: &dyn BufferAllocator,
    src: ByteBuf,
) -> Result<ByteBuf, BufferError> {
    let readable = src.readable_bytes();
    if readable == 0 {
        let _ = src.release();
        return Ok(ByteBuf::empty());
    }
    if alloc.is_direct_buffer_pooled() {
        let mut dst = alloc.direct_buffer(readable)?;
        dst.write_bytes(src.readable()?)?;
        let _ = src.release();
        return Ok(dst);
    }
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpooled_capacities_are_exact() {
        let alloc = UnpooledAllocator;
        let b = alloc.heap_buffer(100).unwrap();
        assert_eq!(b.capacity(), 100);
        assert!(!b.is_direct());
        assert!(alloc.io_buffer(8).unwrap().is_direct());
    }

    #[test]
    fn too_large_allocation_is_rejected() {
        let alloc = UnpooledAllocator;
        assert!(matches!(
            alloc.heap_buffer(MAX_ALLOC + 1),
            Err(BufferError::TooLarge { .. })
        ));
    }

    #[test]
    fn pooled_release_reuses_storage() {
        let alloc = PooledAllocator::new();
        let b = alloc.direct_buffer(1500).unwrap();
        assert_eq!(b.capacity(), 2048);
        b.release().unwrap();
        assert_eq!(alloc.free_count(MemoryKind::Direct, 1500), 1);
        let again = alloc.direct_buffer(2000).unwrap();
        assert_eq!(again.capacity(), 2048);
        assert_eq!(alloc.free_count(MemoryKind::Direct, 2000), 0);
    }

    #[test]
    fn oversized_pooled_request_is_unpooled() {
        let alloc = PooledAllocator::new();
        let b = alloc.heap_buffer((1 << MAX_CLASS_SHIFT) + 1).unwrap();
        b.release().unwrap();
        // Nothing lands on any free list.
        assert_eq!(alloc.free_count(MemoryKind::Heap, 1 << MAX_CLASS_SHIFT), 0);
    }

    #[test]
    fn direct_conversion_copies_when_pooled() {
        let alloc = PooledAllocator::new();
        let mut src = UnpooledAllocator.heap_buffer(16).unwrap();
        src.write_bytes(b"payload").unwrap();
        let dst = new_direct_buffer(&alloc, src).unwrap();
        assert!(dst.is_direct());
        assert_eq!(dst.readable().unwrap(), b"payload");
        dst.release().unwrap();
    }

    #[test]
    fn direct_conversion_skipped_when_unpooled() {
        let alloc = UnpooledAllocator;
        let mut src = alloc.heap_buffer(16).unwrap();
        src.write_bytes(b"payload").unwrap();
        let out = new_direct_buffer(&alloc, src).unwrap();
        assert!(!out.is_direct());
        assert_eq!(out.refcnt(), 1);
        out.release().unwrap();
    }

    #[test]
    fn empty_source_collapses() {
        let alloc = PooledAllocator::new();
        let src = alloc.heap_buffer(1024).unwrap();
        let out = new_direct_buffer(&alloc, src).unwrap();
        assert_eq!(out.capacity(), 0);
    }
}
