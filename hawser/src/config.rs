use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hawser_buffer::{BufferAllocator, UnpooledAllocator};
use log::warn;
use parking_lot::RwLock;

use crate::recv::{AdaptiveRecvBuf, RecvBufAllocator};

/// Default connect deadline.
pub const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 30_000;
/// Default high watermark on pending outbound bytes.
pub const DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK: usize = 64 * 1024;
/// Default low watermark on pending outbound bytes.
pub const DEFAULT_WRITE_BUFFER_LOW_WATER_MARK: usize = 32 * 1024;

/// A recognized per-channel option, for option-bag style configuration
/// (the bootstrap collects these and applies them at channel init).
#[derive(Clone)]
pub enum ChannelOption {
    /// Connect-phase deadline in milliseconds; 0 disables the timeout.
    ConnectTimeoutMillis(u64),
    /// Pending-byte threshold above which the channel reports unwritable.
    WriteBufferHighWaterMark(usize),
    /// Pending-byte threshold below which writability is restored.
    WriteBufferLowWaterMark(usize),
    /// Whether a finished read batch automatically requests the next one.
    AutoRead(bool),
    /// The buffer allocator for inbound reads and codec output.
    Allocator(Arc<dyn BufferAllocator>),
    /// The receive-buffer sizing policy.
    RecvBufAllocator(Arc<dyn RecvBufAllocator>),
}

/// Per-channel configuration.
///
/// Everything here may be read from any thread; writes take effect on the
/// next operation that consults the value.
pub struct ChannelConfig {
    connect_timeout_millis: AtomicU64,
    high_water_mark: AtomicUsize,
    low_water_mark: AtomicUsize,
    auto_read: AtomicBool,
    allocator: RwLock<Arc<dyn BufferAllocator>>,
    recv_alloc: RwLock<Arc<dyn RecvBufAllocator>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelConfig {
    /// Configuration with the documented defaults.
    pub fn new() -> ChannelConfig {
        ChannelConfig {
            connect_timeout_millis: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_MILLIS),
            high_water_mark: AtomicUsize::new(DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK),
            low_water_mark: AtomicUsize::new(DEFAULT_WRITE_BUFFER_LOW_WATER_MARK),
            auto_read: AtomicBool::new(true),
            allocator: RwLock::new(Arc::new(UnpooledAllocator)),
            recv_alloc: RwLock::new(Arc::new(AdaptiveRecvBuf::default())),
        }
    }

    /// Applies one option.
    pub fn set_option(&self, option: ChannelOption) {
        match option {
            ChannelOption::ConnectTimeoutMillis(millis) => self.set_connect_timeout_millis(millis),
            ChannelOption::WriteBufferHighWaterMark(bytes) => self.set_high_water_mark(bytes),
            ChannelOption::WriteBufferLowWaterMark(bytes) => self.set_low_water_mark(bytes),
            ChannelOption::AutoRead(enabled) => self.set_auto_read(enabled),
            ChannelOption::Allocator(alloc) => self.set_allocator(alloc),
            ChannelOption::RecvBufAllocator(policy) => self.set_recv_buf_allocator(policy),
        }
    }

    /// The connect deadline. `None` when the timeout is disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_millis.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Sets the connect deadline in milliseconds; 0 disables it.
    pub fn set_connect_timeout_millis(&self, millis: u64) {
        self.connect_timeout_millis.store(millis, Ordering::Release);
    }

    /// The unwritability threshold.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Sets the unwritability threshold.
    pub fn set_high_water_mark(&self, bytes: usize) {
        if bytes < self.low_water_mark() {
            warn!("high watermark {} below low watermark; writability will oscillate", bytes);
        }
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    /// The writability-restore threshold.
    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark.load(Ordering::Acquire)
    }

    /// Sets the writability-restore threshold.
    pub fn set_low_water_mark(&self, bytes: usize) {
        self.low_water_mark.store(bytes, Ordering::Release);
    }

    /// Whether a finished read batch automatically requests the next one.
    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// Enables or disables auto-read.
    pub fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::Release);
    }

    /// The channel's buffer allocator.
    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.allocator.read())
    }

    /// Replaces the buffer allocator.
    pub fn set_allocator(&self, alloc: Arc<dyn BufferAllocator>) {
        *self.allocator.write() = alloc;
    }

    /// The receive-buffer sizing policy.
    pub fn recv_buf_allocator(&self) -> Arc<dyn RecvBufAllocator> {
        Arc::clone(&self.recv_alloc.read())
    }

    /// Replaces the receive-buffer sizing policy. Takes effect on the next
    /// read batch.
    pub fn set_recv_buf_allocator(&self, policy: Arc<dyn RecvBufAllocator>) {
        *self.recv_alloc.write() = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ChannelConfig::new();
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.high_water_mark(), 64 * 1024);
        assert_eq!(config.low_water_mark(), 32 * 1024);
        assert!(config.auto_read());
    }

    #[test]
    fn zero_timeout_means_disabled() {
        let config = ChannelConfig::new();
        config.set_option(ChannelOption::ConnectTimeoutMillis(0));
        assert_eq!(config.connect_timeout(), None);
    }
}
