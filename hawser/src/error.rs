use std::io;
use std::sync::Arc;
use std::time::Duration;

use hawser_buffer::BufferError;
use hawser_executor::Cause;
use thiserror::Error;

/// The transport error taxonomy.
///
/// Every failure a user can observe arrives either through a future's cause
/// or through `exception_caught` on the pipeline; asynchronous entry points
/// do not return errors directly.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An operation was attempted in a state that cannot serve it:
    /// registering twice, connecting while a connect is pending, writing a
    /// message type the transport cannot carry.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// I/O was attempted on, or outstanding work was drained by, a closed
    /// channel.
    #[error("channel closed")]
    ClosedChannel,

    /// The connect deadline elapsed before the peer answered.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectRefused,

    /// The remote name did not resolve to any usable address.
    #[error("failed to resolve {0}")]
    UnresolvedAddress(String),

    /// An underlying socket or selector error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The operation's promise was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An outbound codec failed to encode a message.
    #[error("encoder failure: {0}")]
    Encoder(String),

    /// An inbound codec failed to decode a frame.
    #[error("decoder failure: {0}")]
    Decoder(String),

    /// A buffer discipline violation reached the transport.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// A handler callback panicked; the payload is carried as text.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl TransportError {
    /// A second `connect` was issued while one is outstanding. No OS connect
    /// is attempted for the second caller.
    pub fn connection_pending() -> TransportError {
        TransportError::IllegalState("a connection attempt is already pending")
    }

    /// Wraps the error for use as a promise failure cause.
    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }

    /// Maps a connect-phase I/O error onto the taxonomy: refusal gets its
    /// own kind, everything else stays an I/O error.
    pub fn from_connect_io(err: io::Error) -> TransportError {
        if err.kind() == io::ErrorKind::ConnectionRefused {
            TransportError::ConnectRefused
        } else {
            TransportError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_is_distinguished_from_other_io() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            TransportError::from_connect_io(refused),
            TransportError::ConnectRefused
        ));
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "gone");
        assert!(matches!(
            TransportError::from_connect_io(reset),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn causes_downcast_back_to_the_taxonomy() {
        let cause = TransportError::ClosedChannel.into_cause();
        let err = cause.downcast_ref::<TransportError>().unwrap();
        assert!(matches!(err, TransportError::ClosedChannel));
    }
}
