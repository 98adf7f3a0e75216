use hawser_buffer::{BufferAllocator, BufferError, ByteBuf};

/// Upper bound on messages delivered per readiness event, so one busy
/// channel cannot monopolize its reactor.
const MAX_MESSAGES_PER_READ: usize = 16;

/// Policy for sizing the receive buffers of a channel's read loop.
pub trait RecvBufAllocator: Send + Sync + 'static {
    /// A fresh handle; one per channel, reused across batches.
    fn new_handle(&self) -> Box<dyn RecvBufHandle>;
}

/// Drives one channel's read loop: sizes each buffer, counts what came
/// back, and decides when the batch is over.
pub trait RecvBufHandle: Send + 'static {
    /// Called at the start of each readiness event.
    fn begin_batch(&mut self);

    /// Allocates the next receive buffer.
    fn allocate(&mut self, alloc: &dyn BufferAllocator) -> Result<ByteBuf, BufferError>;

    /// Records one read's byte count.
    fn record_read(&mut self, bytes: usize);

    /// `true` while the loop should issue another read.
    fn continue_reading(&mut self) -> bool;

    /// Called when the batch ends; adaptive policies adjust here.
    fn batch_complete(&mut self);
}

/// Fixed-size receive buffers.
pub struct FixedRecvBuf {
    size: usize,
}

impl FixedRecvBuf {
    /// Buffers of exactly `size` bytes.
    pub fn new(size: usize) -> FixedRecvBuf {
        assert!(size > 0, "receive buffer size must be positive");
        FixedRecvBuf { size }
    }
}

impl RecvBufAllocator for FixedRecvBuf {
    fn new_handle(&self) -> Box<dyn RecvBufHandle> {
        Box::new(FixedHandle {
            size: self.size,
            last_read: 0,
            messages: 0,
        })
    }
}

struct FixedHandle {
    size: usize,
    last_read: usize,
    messages: usize,
}

impl RecvBufHandle for FixedHandle {
    fn begin_batch(&mut self) {
        self.last_read = 0;
        self.messages = 0;
    }

    fn allocate(&mut self, alloc: &dyn BufferAllocator) -> Result<ByteBuf, BufferError> {
        alloc.io_buffer(self.size)
    }

    fn record_read(&mut self, bytes: usize) {
        self.last_read = bytes;
        self.messages += 1;
    }

    fn continue_reading(&mut self) -> bool {
        // Stop when the kernel had less than a full buffer for us.
        self.messages < MAX_MESSAGES_PER_READ && self.last_read == self.size
    }

    fn batch_complete(&mut self) {}
}

/// Receive buffers that grow after full reads and shrink after two
/// consecutive under-filled batches.
pub struct AdaptiveRecvBuf {
    min: usize,
    initial: usize,
    max: usize,
}

impl Default for AdaptiveRecvBuf {
    fn default() -> Self {
        AdaptiveRecvBuf::new(64, 2048, 64 * 1024)
    }
}

impl AdaptiveRecvBuf {
    /// Policy bounded to `[min, max]`, starting at `initial`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min <= initial <= max`.
    pub fn new(min: usize, initial: usize, max: usize) -> AdaptiveRecvBuf {
        assert!(min > 0 && min <= initial && initial <= max, "bad recv-buffer bounds");
        AdaptiveRecvBuf { min, initial, max }
    }
}

impl RecvBufAllocator for AdaptiveRecvBuf {
    fn new_handle(&self) -> Box<dyn RecvBufHandle> {
        Box::new(AdaptiveHandle {
            min: self.min,
            max: self.max,
            guess: self.initial,
            last_read: 0,
            messages: 0,
            small_streak: 0,
        })
    }
}

struct AdaptiveHandle {
    min: usize,
    max: usize,
    guess: usize,
    last_read: usize,
    messages: usize,
    small_streak: u32,
}

impl RecvBufHandle for AdaptiveHandle {
    fn begin_batch(&mut self) {
        self.last_read = 0;
        self.messages = 0;
    }

    fn allocate(&mut self, alloc: &dyn BufferAllocator) -> Result<ByteBuf, BufferError> {
        alloc.io_buffer(self.guess)
    }

    fn record_read(&mut self, bytes: usize) {
        self.last_read = bytes;
        self.messages += 1;
        if bytes == self.guess {
            // The kernel filled us completely; bigger buffers may pay off
            // within the same batch.
            self.guess = (self.guess * 2).min(self.max);
            self.small_streak = 0;
        }
    }

    fn continue_reading(&mut self) -> bool {
        self.messages < MAX_MESSAGES_PER_READ && self.last_read > 0 && self.last_read >= self.guess / 2
    }

    fn batch_complete(&mut self) {
        if self.last_read > 0 && self.last_read < self.guess / 2 {
            self.small_streak += 1;
            if self.small_streak >= 2 {
                self.guess = (self.guess / 2).max(self.min);
                self.small_streak = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_buffer::UnpooledAllocator;

    #[test]
    fn fixed_handle_stops_on_partial_read() {
        let policy = FixedRecvBuf::new(1024);
        let mut handle = policy.new_handle();
        handle.begin_batch();
        let buf = handle.allocate(&UnpooledAllocator).unwrap();
        assert_eq!(buf.capacity(), 1024);
        handle.record_read(1024);
        assert!(handle.continue_reading());
        handle.record_read(100);
        assert!(!handle.continue_reading());
    }

    #[test]
    fn fixed_handle_bounds_the_batch() {
        let policy = FixedRecvBuf::new(64);
        let mut handle = policy.new_handle();
        handle.begin_batch();
        for _ in 0..MAX_MESSAGES_PER_READ {
            handle.record_read(64);
        }
        assert!(!handle.continue_reading());
    }

    #[test]
    fn adaptive_handle_grows_on_full_reads() {
        let policy = AdaptiveRecvBuf::new(64, 512, 4096);
        let mut handle = policy.new_handle();
        handle.begin_batch();
        handle.record_read(512);
        let buf = handle.allocate(&UnpooledAllocator).unwrap();
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn adaptive_handle_shrinks_after_two_small_batches() {
        let policy = AdaptiveRecvBuf::new(64, 1024, 4096);
        let mut handle = policy.new_handle();
        for _ in 0..2 {
            handle.begin_batch();
            handle.record_read(10);
            handle.batch_complete();
        }
        let buf = handle.allocate(&UnpooledAllocator).unwrap();
        assert_eq!(buf.capacity(), 512);
    }
}
