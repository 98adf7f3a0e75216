use std::net::SocketAddr;

use hawser_executor::{Cause, Promise};

use crate::message::Message;
use crate::pipeline::HandlerContext;

/// Lifecycle callbacks every handler gets, whatever direction it serves.
pub trait ChannelHandler: Send + 'static {
    /// The handler was attached to a pipeline. Runs on the context's
    /// executor before any event reaches the handler.
    fn handler_added(&mut self, _ctx: &HandlerContext) {}

    /// The handler was detached from its pipeline.
    fn handler_removed(&mut self, _ctx: &HandlerContext) {}
}

/// Reacts to inbound events: data and lifecycle changes flowing from the
/// socket toward the application.
///
/// Every callback defaults to forwarding the event to the next
/// inbound-capable context, so a handler only overrides what it cares
/// about. A handler that consumes a `channel_read` message without
/// forwarding it owns that message, including releasing it if it is
/// reference counted.
///
/// Callbacks run on the context's executor; they must not block.
pub trait InboundHandler: ChannelHandler {
    /// The channel was registered with its reactor.
    fn channel_registered(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_registered();
    }

    /// The channel was deregistered from its reactor.
    fn channel_unregistered(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_unregistered();
    }

    /// The channel became active (connected).
    fn channel_active(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
    }

    /// The channel left the active state. Fires at most once, and only
    /// after `channel_active`.
    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_inactive();
    }

    /// One inbound message.
    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    /// The current read batch is done; no more `channel_read` until the
    /// next readiness event.
    fn channel_read_complete(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_read_complete();
    }

    /// The outbound buffer crossed a watermark; check
    /// `ctx.channel().is_writable()`.
    fn channel_writability_changed(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_writability_changed();
    }

    /// An application-defined event.
    fn user_event(&mut self, ctx: &HandlerContext, event: Message) {
        ctx.fire_user_event(event);
    }

    /// An error surfaced on the inbound path.
    fn exception_caught(&mut self, ctx: &HandlerContext, cause: Cause) {
        ctx.fire_exception_caught(cause);
    }
}

/// Intercepts outbound operations travelling from the application toward
/// the socket.
///
/// Every callback defaults to forwarding toward the pipeline head, which
/// terminates on the channel's internals. Errors inside an outbound
/// operation fail `promise`; they are never injected into the inbound
/// path.
pub trait OutboundHandler: ChannelHandler {
    /// Bind the channel to a local address.
    fn bind(&mut self, ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) {
        ctx.bind_with(addr, promise);
    }

    /// Connect to `remote`, optionally from `local`.
    fn connect(
        &mut self,
        ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        ctx.connect_with(remote, local, promise);
    }

    /// Disconnect from the peer.
    fn disconnect(&mut self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.disconnect_with(promise);
    }

    /// Close the channel.
    fn close(&mut self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.close_with(promise);
    }

    /// Deregister the channel from its reactor.
    fn deregister(&mut self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.deregister_with(promise);
    }

    /// Request the next read batch.
    fn read(&mut self, ctx: &HandlerContext) {
        ctx.read();
    }

    /// Enqueue a message on the outbound buffer.
    fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) {
        ctx.write_with(msg, promise);
    }

    /// Flush the outbound buffer to the socket.
    fn flush(&mut self, ctx: &HandlerContext) {
        ctx.flush();
    }
}

/// A handler participating in both directions. Implemented automatically
/// for anything that is both an [`InboundHandler`] and an
/// [`OutboundHandler`].
pub trait DuplexHandler: InboundHandler + OutboundHandler {}

impl<T> DuplexHandler for T where T: InboundHandler + OutboundHandler {}

/// A handler boxed together with its capability, ready to be added to a
/// pipeline.
///
/// The variant decides the context's capability bits, which propagation
/// uses to skip non-participating contexts in O(1).
pub enum Handler {
    /// Inbound-capable only.
    Inbound(Box<dyn InboundHandler>),
    /// Outbound-capable only.
    Outbound(Box<dyn OutboundHandler>),
    /// Capable in both directions.
    Duplex(Box<dyn DuplexHandler>),
}

impl Handler {
    /// Boxes an inbound handler.
    pub fn inbound(handler: impl InboundHandler) -> Handler {
        Handler::Inbound(Box::new(handler))
    }

    /// Boxes an outbound handler.
    pub fn outbound(handler: impl OutboundHandler) -> Handler {
        Handler::Outbound(Box::new(handler))
    }

    /// Boxes a handler capable in both directions.
    pub fn duplex(handler: impl DuplexHandler) -> Handler {
        Handler::Duplex(Box::new(handler))
    }
}

/// Cached capability bits of a pipeline context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Receives inbound events.
    pub inbound: bool,
    /// Intercepts outbound operations.
    pub outbound: bool,
}

impl Capabilities {
    pub(crate) fn of(handler: &Handler) -> Capabilities {
        match handler {
            Handler::Inbound(_) => Capabilities {
                inbound: true,
                outbound: false,
            },
            Handler::Outbound(_) => Capabilities {
                inbound: false,
                outbound: true,
            },
            Handler::Duplex(_) => Capabilities {
                inbound: true,
                outbound: true,
            },
        }
    }
}
