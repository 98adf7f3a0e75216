use hawser::{ChannelHandler, HandlerContext, Message, OutboundHandler, TransportError};
use hawser_buffer::ByteBuf;
use hawser_executor::Promise;
use log::warn;

/// Encodes one message type into bytes.
pub trait Encoder: Send + 'static {
    /// The message type this encoder consumes.
    type Msg: Send + 'static;

    /// A capacity hint for the output buffer.
    fn expected_len(&self, _msg: &Self::Msg) -> usize {
        256
    }

    /// Writes `msg` into `out`.
    fn encode(&mut self, msg: &Self::Msg, out: &mut ByteBuf) -> Result<(), TransportError>;
}

/// An outbound adapter that turns typed messages into buffers on their way
/// to the socket.
///
/// A matching message gets a buffer from the channel's allocator, is
/// encoded into it, and the buffer continues head-ward carrying the write's
/// promise. On encode failure the buffer is released and the promise fails
/// with the *Encoder* kind; nothing enters the inbound path. Non-matching
/// messages pass through untouched.
pub struct MessageToByte<E: Encoder> {
    encoder: E,
}

impl<E: Encoder> MessageToByte<E> {
    /// Wraps `encoder`.
    pub fn new(encoder: E) -> MessageToByte<E> {
        MessageToByte { encoder }
    }
}

impl<E: Encoder> ChannelHandler for MessageToByte<E> {}

impl<E: Encoder> OutboundHandler for MessageToByte<E> {
    fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) {
        let msg = match msg.downcast::<E::Msg>() {
            Ok(msg) => *msg,
            Err(other) => return ctx.write_with(other, promise),
        };
        let alloc = ctx.channel().config().allocator();
        let mut out = match alloc.io_buffer(self.encoder.expected_len(&msg)) {
            Ok(out) => out,
            Err(err) => {
                promise.try_failure(TransportError::Buffer(err).into_cause());
                return;
            }
        };
        match self.encoder.encode(&msg, &mut out) {
            Ok(()) => ctx.write_with(Box::new(out), promise),
            Err(err) => {
                if let Err(release_err) = out.release() {
                    warn!("failed to release after encode error: {}", release_err);
                }
                promise.try_failure(
                    TransportError::Encoder(err.to_string()).into_cause(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_buffer::{BufferAllocator, UnpooledAllocator};

    struct Upper;

    impl Encoder for Upper {
        type Msg = String;

        fn expected_len(&self, msg: &String) -> usize {
            msg.len()
        }

        fn encode(&mut self, msg: &String, out: &mut ByteBuf) -> Result<(), TransportError> {
            out.write_bytes(msg.to_uppercase().as_bytes())
                .map_err(TransportError::Buffer)
        }
    }

    #[test]
    fn encoder_fills_the_sized_buffer() {
        let mut encoder = Upper;
        let msg = "hello".to_owned();
        let mut out = UnpooledAllocator
            .io_buffer(encoder.expected_len(&msg))
            .unwrap();
        encoder.encode(&msg, &mut out).unwrap();
        assert_eq!(out.readable().unwrap(), b"HELLO");
        out.release().unwrap();
    }
}
