use crate::handler::{ChannelHandler, InboundHandler};
use crate::message::{release_refcounted, Message};
use crate::pipeline::HandlerContext;

/// The typed half of a [`TypedInbound`] adapter: gets exactly the messages
/// whose concrete type matches `Msg`.
pub trait TypedHandler: Send + 'static {
    /// The message type this handler consumes.
    type Msg: Send + 'static;

    /// One matched message. The adapter keeps ownership; with auto-release
    /// on, a reference-counted message is released when this returns.
    fn message_received(&mut self, ctx: &HandlerContext, msg: &mut Self::Msg);
}

/// An inbound adapter that delegates type-matching messages to a
/// [`TypedHandler`] and forwards everything else untouched.
///
/// With `auto_release` (the default), matched reference-counted messages
/// are released after the typed callback returns; messages that do not
/// match are never released here - they belong to whoever handles them
/// downstream.
pub struct TypedInbound<H: TypedHandler> {
    inner: H,
    auto_release: bool,
}

impl<H: TypedHandler> TypedInbound<H> {
    /// Adapter with auto-release enabled.
    pub fn new(inner: H) -> TypedInbound<H> {
        TypedInbound {
            inner,
            auto_release: true,
        }
    }

    /// Controls whether matched refcounted messages are released after the
    /// callback.
    pub fn with_auto_release(mut self, auto_release: bool) -> TypedInbound<H> {
        self.auto_release = auto_release;
        self
    }
}

impl<H: TypedHandler> ChannelHandler for TypedInbound<H> {}

impl<H: TypedHandler> InboundHandler for TypedInbound<H> {
    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        match msg.downcast::<H::Msg>() {
            Ok(mut typed) => {
                self.inner.message_received(ctx, &mut typed);
                if self.auto_release {
                    release_refcounted(typed.as_ref());
                }
            }
            Err(other) => ctx.fire_channel_read(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::Handler;
    use hawser_buffer::{BufferAllocator, ByteBuf, UnpooledAllocator};
    use parking_lot::Mutex;
    use std::sync::Arc;

    // An unregistered channel dispatches pipeline events inline, which is
    // exactly what these tests want.

    struct Collect {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl TypedHandler for Collect {
        type Msg = String;

        fn message_received(&mut self, _ctx: &HandlerContext, msg: &mut String) {
            self.seen.lock().push(msg.clone());
        }
    }

    #[test]
    fn matched_messages_reach_the_typed_callback() {
        let channel = Channel::tcp().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        channel
            .pipeline()
            .add_last(
                "typed",
                Handler::inbound(TypedInbound::new(Collect {
                    seen: Arc::clone(&seen),
                })),
            )
            .unwrap();
        channel
            .pipeline()
            .fire_channel_read(Box::new("ahoy".to_owned()));
        assert_eq!(*seen.lock(), vec!["ahoy".to_owned()]);
    }

    #[test]
    fn matched_buffers_are_auto_released() {
        struct Consume;
        impl TypedHandler for Consume {
            type Msg = ByteBuf;
            fn message_received(&mut self, _ctx: &HandlerContext, _msg: &mut ByteBuf) {}
        }
        let channel = Channel::tcp().unwrap();
        channel
            .pipeline()
            .add_last("typed", Handler::inbound(TypedInbound::new(Consume)))
            .unwrap();
        let buf = UnpooledAllocator.heap_buffer(8).unwrap();
        let probe = buf.retained().unwrap();
        channel.pipeline().fire_channel_read(Box::new(buf));
        // The adapter released the matched message; only the probe is left.
        assert_eq!(probe.refcnt(), 1);
        probe.release().unwrap();
    }

    #[test]
    fn unmatched_messages_forward_to_the_tail_untouched() {
        let channel = Channel::tcp().unwrap();
        channel
            .pipeline()
            .add_last(
                "typed",
                Handler::inbound(TypedInbound::new(Collect {
                    seen: Arc::new(Mutex::new(Vec::new())),
                })),
            )
            .unwrap();
        let buf = UnpooledAllocator.heap_buffer(8).unwrap();
        let probe = buf.retained().unwrap();
        // A ByteBuf does not match Msg = String, so the adapter forwards it
        // and the tail performs the release.
        channel.pipeline().fire_channel_read(Box::new(buf));
        assert_eq!(probe.refcnt(), 1);
        probe.release().unwrap();
    }
}
