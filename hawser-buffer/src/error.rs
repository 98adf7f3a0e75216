use thiserror::Error;

/// Failures produced by buffer discipline violations.
///
/// All three kinds indicate a programming error in the caller, not an I/O
/// condition; none of them are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// A `retain` or `release` would have moved the reference count through
    /// an illegal transition (resurrecting a dead buffer, over-releasing, or
    /// overflowing the counter). The failed operation has been undone.
    #[error("illegal reference count {count} for delta {delta}")]
    IllegalRefCount {
        /// The count observed before the failed operation.
        count: i32,
        /// The signed adjustment that was attempted.
        delta: i32,
    },

    /// An allocation or write exceeded the allowed capacity.
    #[error("buffer too large: {requested} bytes (limit {limit})")]
    TooLarge {
        /// Bytes requested.
        requested: usize,
        /// The limit that was exceeded.
        limit: usize,
    },

    /// The buffer's bytes were accessed after its count reached zero.
    #[error("buffer accessed after release")]
    Released,
}
