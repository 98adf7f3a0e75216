//! # Hawser Buffer - Reference-Counted Byte Buffers
//!
//! `hawser-buffer` provides the byte-buffer layer of the hawser transport
//! engine: a mutable byte region with explicit reference counting and the
//! allocator policies that back it.
//!
//! ## Overview
//!
//! A [`ByteBuf`] is a byte region with two cursors and an atomic reference
//! count:
//!
//! ```text
//!      +-------------------+------------------+------------------+
//!      | discardable bytes |  readable bytes  |  writable bytes  |
//!      +-------------------+------------------+------------------+
//!      |                   |                  |                  |
//!      0      <=      reader_index   <=   writer_index    <=   capacity
//! ```
//!
//! The count starts at 1 on allocation. [`ByteBuf::retain`] and
//! [`ByteBuf::release`] move it up and down; the release that drives it to
//! zero returns the memory to the allocator that produced it, exactly once.
//! Misuse - releasing past zero, retaining a dead buffer, touching the bytes
//! after release - surfaces as a [`BufferError`] instead of corrupting
//! memory.
//!
//! There is no destructor-driven release: the pipeline's tail and the typed
//! inbound adapter own the release discipline, so a leaked handle is a leak,
//! not a double free.
//!
//! ## Allocators
//!
//! [`BufferAllocator`] is the allocation policy seam. Two implementations
//! ship with the crate:
//!
//! - [`UnpooledAllocator`]: every buffer is a fresh allocation, freed on
//!   deallocation.
//! - [`PooledAllocator`]: power-of-two size classes with bounded free lists;
//!   deallocated buffers return to their class.
//!
//! Whether a buffer is pooled, and whether it is "direct" or "heap", is the
//! allocator's business: the buffer contract is identical either way.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

pub(crate) mod alloc;
pub(crate) mod byte_buf;
pub(crate) mod error;

pub use alloc::{new_direct_buffer, BufferAllocator, PooledAllocator, UnpooledAllocator};
pub use byte_buf::ByteBuf;
pub use error::BufferError;
