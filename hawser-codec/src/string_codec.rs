use bytes::BytesMut;
use hawser::{
    ChannelHandler, HandlerContext, InboundHandler, Message, OutboundHandler, TransportError,
};
use hawser_executor::Promise;
use log::warn;

/// UTF-8 string codec: decodes inbound [`BytesMut`] frames into `String`s
/// and encodes outbound `String`s into transport buffers.
///
/// Sits above a frame decoder; invalid UTF-8 is a *Decoder* error through
/// `exception_caught`.
pub struct StringCodec;

impl Default for StringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StringCodec {
    /// A new codec; stateless.
    pub fn new() -> StringCodec {
        StringCodec
    }
}

impl ChannelHandler for StringCodec {}

impl InboundHandler for StringCodec {
    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        let frame = match msg.downcast::<BytesMut>() {
            Ok(frame) => *frame,
            Err(other) => return ctx.fire_channel_read(other),
        };
        match String::from_utf8(frame.to_vec()) {
            Ok(text) => ctx.fire_channel_read(Box::new(text)),
            Err(err) => ctx.fire_exception_caught(
                TransportError::Decoder(format!("invalid utf-8: {}", err)).into_cause(),
            ),
        }
    }
}

impl OutboundHandler for StringCodec {
    fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) {
        let text = match msg.downcast::<String>() {
            Ok(text) => *text,
            Err(other) => return ctx.write_with(other, promise),
        };
        let alloc = ctx.channel().config().allocator();
        let mut out = match alloc.io_buffer(text.len()) {
            Ok(out) => out,
            Err(err) => {
                promise.try_failure(TransportError::Buffer(err).into_cause());
                return;
            }
        };
        if let Err(err) = out.write_bytes(text.as_bytes()) {
            if let Err(release_err) = out.release() {
                warn!("failed to release after encode error: {}", release_err);
            }
            promise.try_failure(TransportError::Encoder(err.to_string()).into_cause());
            return;
        }
        ctx.write_with(Box::new(out), promise);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser::{Channel, Handler, TypedHandler, TypedInbound};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Sink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl TypedHandler for Sink {
        type Msg = String;

        fn message_received(&mut self, _ctx: &HandlerContext, msg: &mut String) {
            self.seen.lock().push(msg.clone());
        }
    }

    #[test]
    fn frames_decode_to_strings_through_a_pipeline() {
        let channel = Channel::tcp().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline
            .add_last("strings", Handler::duplex(StringCodec::new()))
            .unwrap();
        pipeline
            .add_last(
                "sink",
                Handler::inbound(TypedInbound::new(Sink {
                    seen: Arc::clone(&seen),
                })),
            )
            .unwrap();
        pipeline.fire_channel_read(Box::new(BytesMut::from(&b"ahoy"[..])));
        assert_eq!(*seen.lock(), vec!["ahoy".to_owned()]);
    }
}
